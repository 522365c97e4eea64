//! Import environment composition.
//!
//! A guest is linked against an ordered list of [`ImportNamespace`]s. Looking up a name
//! walks the list front to back and takes the first namespace that defines it. Function
//! imports that no namespace defines are bound to a stub: calling it never traps, logs
//! the name and arguments, records the call in [`UnresolvedCalls`], and returns zero
//! values for every declared result.
//!
//! A stub has the signature of the import it stands in for. If the guest imports one
//! unresolved name twice with different signatures, linking fails.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use wasmtime::{ExternType, FuncType, Linker, Module, Val};

use crate::abi::IMPORT_MODULE;
use crate::loader::LoadError;

/// Defines one host function in a linker under `(module, name)`.
pub type Definer =
    Arc<dyn Fn(&mut Linker<()>, &str, &str) -> wasmtime::Result<()> + Send + Sync + 'static>;

/// A named table of host functions.
#[derive(Clone)]
pub struct ImportNamespace {
    label: String,
    entries: HashMap<String, Definer>,
}

impl ImportNamespace {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: HashMap::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Register a host function. A later definition of the same name replaces the earlier one.
    pub fn define<F>(&mut self, name: impl Into<String>, definer: F) -> &mut Self
    where
        F: Fn(&mut Linker<()>, &str, &str) -> wasmtime::Result<()> + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Arc::new(definer));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn get(&self, name: &str) -> Option<&Definer> {
        self.entries.get(name)
    }
}

impl std::fmt::Debug for ImportNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("ImportNamespace")
            .field("label", &self.label)
            .field("entries", &names)
            .finish()
    }
}

/// Where a name resolves to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resolution<'a> {
    /// Defined by the namespace at `index` (first match wins).
    Defined { index: usize, namespace: &'a str },
    /// No namespace defines it; a diagnostic stub will be bound.
    Stub,
}

/// An argument value seen by a stub.
#[derive(Clone, Debug, PartialEq)]
pub enum StubArg {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Other(String),
}

impl From<&Val> for StubArg {
    fn from(val: &Val) -> Self {
        match val {
            Val::I32(v) => StubArg::I32(*v),
            Val::I64(v) => StubArg::I64(*v),
            Val::F32(bits) => StubArg::F32(f32::from_bits(*bits)),
            Val::F64(bits) => StubArg::F64(f64::from_bits(*bits)),
            other => StubArg::Other(format!("{other:?}")),
        }
    }
}

/// One call that landed on a stub.
#[derive(Clone, Debug, PartialEq)]
pub struct UnresolvedCall {
    pub name: String,
    pub args: Vec<StubArg>,
}

/// Number of most recent stub calls kept with their arguments.
pub const RECENT_CALLS: usize = 64;

#[derive(Debug, Default)]
struct CallLog {
    total: u64,
    per_name: HashMap<String, u64>,
    recent: VecDeque<UnresolvedCall>,
}

/// Shared log of stub calls. Cloning shares the same log.
///
/// Counts every call but keeps only the last [`RECENT_CALLS`] with arguments, so a
/// guest hammering a missing import cannot grow it without bound.
#[derive(Clone, Debug, Default)]
pub struct UnresolvedCalls {
    inner: Arc<Mutex<CallLog>>,
}

impl UnresolvedCalls {
    /// Record a call. Returns true if it is the first call to that name.
    fn push(&self, call: UnresolvedCall) -> bool {
        let mut log = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        log.total += 1;
        let count = log.per_name.entry(call.name.clone()).or_insert(0);
        *count += 1;
        let first = *count == 1;
        if log.recent.len() == RECENT_CALLS {
            log.recent.pop_front();
        }
        log.recent.push_back(call);
        first
    }

    /// The most recent calls, oldest first.
    pub fn recent(&self) -> Vec<UnresolvedCall> {
        let log = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        log.recent.iter().cloned().collect()
    }

    /// Calls per import name, sorted by name.
    pub fn counts(&self) -> Vec<(String, u64)> {
        let log = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut counts: Vec<(String, u64)> =
            log.per_name.iter().map(|(name, n)| (name.clone(), *n)).collect();
        counts.sort_unstable();
        counts
    }

    /// Total number of stub calls so far.
    pub fn total(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).total
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Ordered composition of import namespaces with a stub fallback.
#[derive(Clone, Debug, Default)]
pub struct EnvironmentResolver {
    namespaces: Vec<ImportNamespace>,
    unresolved: UnresolvedCalls,
}

impl EnvironmentResolver {
    pub fn new(namespaces: impl IntoIterator<Item = ImportNamespace>) -> Self {
        Self {
            namespaces: namespaces.into_iter().collect(),
            unresolved: UnresolvedCalls::default(),
        }
    }

    /// Append a namespace with the lowest priority so far.
    pub fn push(&mut self, namespace: ImportNamespace) -> &mut Self {
        self.namespaces.push(namespace);
        self
    }

    pub fn namespaces(&self) -> &[ImportNamespace] {
        &self.namespaces
    }

    pub fn unresolved_calls(&self) -> &UnresolvedCalls {
        &self.unresolved
    }

    pub fn lookup(&self, name: &str) -> Resolution<'_> {
        self.namespaces
            .iter()
            .enumerate()
            .find(|(_, ns)| ns.contains(name))
            .map(|(index, ns)| Resolution::Defined {
                index,
                namespace: ns.label(),
            })
            .unwrap_or(Resolution::Stub)
    }

    /// Define every import `module` declares in `linker`.
    ///
    /// Must be called before instantiating the module.
    pub fn link(&self, linker: &mut Linker<()>, module: &Module) -> Result<(), LoadError> {
        let mut stubbed: HashMap<&str, FuncType> = HashMap::new();
        for import in module.imports() {
            let (module_name, name) = (import.module(), import.name());
            if module_name != IMPORT_MODULE {
                return Err(LoadError::UnsupportedImport {
                    module: module_name.to_string(),
                    name: name.to_string(),
                    reason: format!("only `{IMPORT_MODULE}` imports are provided"),
                });
            }

            if let Resolution::Defined { index, namespace } = self.lookup(name) {
                tracing::trace!(import = name, namespace, "resolved import");
                if let Some(definer) = self.namespaces[index].get(name) {
                    definer(linker, module_name, name).map_err(|e| LoadError::Link {
                        name: name.to_string(),
                        reason: format!("{e:#}"),
                    })?;
                }
                continue;
            }

            match import.ty() {
                ExternType::Func(ty) => match stubbed.get(name) {
                    Some(existing) if FuncType::eq(existing, &ty) => {}
                    Some(existing) => {
                        return Err(LoadError::UnsupportedImport {
                            module: module_name.to_string(),
                            name: name.to_string(),
                            reason: format!(
                                "unresolved import declared as both {existing} and {ty}"
                            ),
                        });
                    }
                    None => {
                        self.define_stub(linker, name, ty.clone())?;
                        stubbed.insert(name, ty);
                    }
                },
                other => {
                    return Err(LoadError::UnsupportedImport {
                        module: module_name.to_string(),
                        name: name.to_string(),
                        reason: format!("unresolved non-function import ({other:?})"),
                    });
                }
            }
        }
        Ok(())
    }

    fn define_stub(
        &self,
        linker: &mut Linker<()>,
        name: &str,
        ty: FuncType,
    ) -> Result<(), LoadError> {
        if ty.results().any(|t| Val::default_for_ty(&t).is_none()) {
            return Err(LoadError::UnsupportedImport {
                module: IMPORT_MODULE.to_string(),
                name: name.to_string(),
                reason: "stub cannot produce a default for a non-nullable result".to_string(),
            });
        }

        tracing::warn!(import = name, "import not provided by host; binding stub");

        let stub_name = name.to_string();
        let log = self.unresolved.clone();
        let result_types = ty.clone();
        linker
            .func_new(IMPORT_MODULE, name, ty, move |_caller, params, results| {
                let args: Vec<StubArg> = params.iter().map(StubArg::from).collect();
                for (slot, ty) in results.iter_mut().zip(result_types.results()) {
                    if let Some(zero) = Val::default_for_ty(&ty) {
                        *slot = zero;
                    }
                }
                let call = UnresolvedCall {
                    name: stub_name.clone(),
                    args,
                };
                // Loud once per name.
                if log.push(call.clone()) {
                    tracing::error!(import = %call.name, args = ?call.args, "NOT IMPLEMENTED");
                } else {
                    tracing::trace!(import = %call.name, args = ?call.args, "NOT IMPLEMENTED");
                }
                Ok(())
            })
            .map_err(|e| LoadError::Link {
                name: name.to_string(),
                reason: format!("{e:#}"),
            })?;
        Ok(())
    }
}
