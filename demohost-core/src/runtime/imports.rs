//! Host import definitions.
//!
//! The `libm` namespace supplies the scalar math and logging functions the demos
//! module imports under module `"env"`.

use wasmtime::{Caller, Extern};

use crate::abi::{MEMORY_EXPORT, host_imports};
use crate::env::ImportNamespace;
use crate::memory::utf8_lossy;

/// Build the `libm` namespace.
///
/// Math is evaluated in double precision and rounded back to `f32`.
pub fn libm_namespace() -> ImportNamespace {
    let mut ns = ImportNamespace::new("libm");

    ns.define(host_imports::ATAN2F, |linker, module, name| {
        linker.func_wrap(module, name, |y: f32, x: f32| -> f32 {
            (y as f64).atan2(x as f64) as f32
        })?;
        Ok(())
    });

    ns.define(host_imports::COSF, |linker, module, name| {
        linker.func_wrap(module, name, |x: f32| -> f32 { (x as f64).cos() as f32 })?;
        Ok(())
    });

    ns.define(host_imports::SINF, |linker, module, name| {
        linker.func_wrap(module, name, |x: f32| -> f32 { (x as f64).sin() as f32 })?;
        Ok(())
    });

    ns.define(host_imports::SQRTF, |linker, module, name| {
        linker.func_wrap(module, name, |x: f32| -> f32 { (x as f64).sqrt() as f32 })?;
        Ok(())
    });

    ns.define(host_imports::LOG_WASM, |linker, module, name| {
        linker.func_wrap(
            module,
            name,
            |mut caller: Caller<'_, ()>, ptr: u32, len: u32| {
                let Some(memory) = caller
                    .get_export(MEMORY_EXPORT)
                    .and_then(Extern::into_memory)
                else {
                    tracing::warn!("logWasm called before guest memory is available");
                    return;
                };

                match utf8_lossy(memory.data(&caller), ptr, len) {
                    Ok(msg) => tracing::info!(target: "guest", "{msg}"),
                    Err(e) => tracing::warn!(error = %e, "logWasm: bad string range"),
                }
            },
        )?;
        Ok(())
    });

    ns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvironmentResolver, Resolution};
    use crate::testing::capture_logs;
    use wasmtime::{Engine, Linker, Module, Store};

    const MATH_GUEST: &str = r#"
        (module
            (import "env" "atan2f" (func $atan2f (param f32 f32) (result f32)))
            (import "env" "cosf" (func $cosf (param f32) (result f32)))
            (import "env" "sinf" (func $sinf (param f32) (result f32)))
            (import "env" "sqrtf" (func $sqrtf (param f32) (result f32)))
            (import "env" "logWasm" (func $log (param i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "hello from guest")
            (func (export "atan2") (param f32 f32) (result f32)
                (call $atan2f (local.get 0) (local.get 1)))
            (func (export "cos") (param f32) (result f32) (call $cosf (local.get 0)))
            (func (export "sin") (param f32) (result f32) (call $sinf (local.get 0)))
            (func (export "sqrt") (param f32) (result f32) (call $sqrtf (local.get 0)))
            (func (export "log") (param i32 i32) (call $log (local.get 0) (local.get 1))))
    "#;

    fn guest() -> (Store<()>, wasmtime::Instance, EnvironmentResolver) {
        let engine = Engine::default();
        let module = Module::new(&engine, wat::parse_str(MATH_GUEST).unwrap()).unwrap();
        let resolver = EnvironmentResolver::new([libm_namespace()]);
        let mut linker = Linker::new(&engine);
        resolver.link(&mut linker, &module).unwrap();
        let mut store = Store::new(&engine, ());
        let instance = linker.instantiate(&mut store, &module).unwrap();
        (store, instance, resolver)
    }

    #[test]
    fn libm_defines_every_host_import() {
        let resolver = EnvironmentResolver::new([libm_namespace()]);
        for name in [
            host_imports::ATAN2F,
            host_imports::COSF,
            host_imports::SINF,
            host_imports::SQRTF,
            host_imports::LOG_WASM,
        ] {
            assert!(matches!(
                resolver.lookup(name),
                Resolution::Defined { index: 0, .. }
            ));
        }
    }

    #[test]
    fn math_imports_match_std() {
        let (mut store, instance, resolver) = guest();
        let atan2 = instance
            .get_typed_func::<(f32, f32), f32>(&mut store, "atan2")
            .unwrap();
        let sqrt = instance.get_typed_func::<f32, f32>(&mut store, "sqrt").unwrap();
        let cos = instance.get_typed_func::<f32, f32>(&mut store, "cos").unwrap();
        let sin = instance.get_typed_func::<f32, f32>(&mut store, "sin").unwrap();

        assert_eq!(atan2.call(&mut store, (1.0, 1.0)).unwrap(), std::f32::consts::FRAC_PI_4);
        assert_eq!(sqrt.call(&mut store, 16.0).unwrap(), 4.0);
        assert_eq!(cos.call(&mut store, 0.0).unwrap(), 1.0);
        assert_eq!(sin.call(&mut store, 0.0).unwrap(), 0.0);
        assert!(resolver.unresolved_calls().is_empty());
    }

    #[test]
    fn log_import_emits_guest_text() {
        let (mut store, instance, _) = guest();
        let log = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "log")
            .unwrap();

        let output = capture_logs(|| log.call(&mut store, (16, 16)).unwrap());
        assert!(output.contains("hello from guest"), "{output}");
        assert!(output.contains("INFO"), "{output}");
    }

    #[test]
    fn log_import_warns_on_bad_range_without_trapping() {
        let (mut store, instance, _) = guest();
        let log = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "log")
            .unwrap();

        let output = capture_logs(|| log.call(&mut store, (65530, 100)).unwrap());
        assert!(output.contains("bad string range"), "{output}");
        assert!(!output.contains("hello from guest"), "{output}");
    }
}
