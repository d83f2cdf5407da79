// Validates the WGSL sources with naga so shader regressions are caught
// without a GPU.

use compute::shaders::{source, specialize};
use compute::Kernel;

fn validate(src: &str) -> naga::Module {
    let module = match naga::front::wgsl::parse_str(src) {
        Ok(module) => module,
        Err(err) => panic!("WGSL parse failed:\n{}", err.emit_to_string(src)),
    };
    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    if let Err(err) = validator.validate(&module) {
        panic!("WGSL validation failed: {err:?}");
    }
    module
}

#[test]
fn shaders_validate() {
    for kernel in [Kernel::CastRays, Kernel::Forward] {
        let module = validate(source(kernel));
        assert_eq!(module.entry_points.len(), 1);
        assert_eq!(module.entry_points[0].name, "main");
        assert_eq!(module.entry_points[0].workgroup_size, [64, 1, 1]);
    }
}

#[test]
fn binding_counts_match_layout() {
    for kernel in [Kernel::CastRays, Kernel::Forward] {
        let module = validate(source(kernel));
        let mut bindings: Vec<u32> = module
            .global_variables
            .iter()
            .filter_map(|(_, var)| var.binding.as_ref().map(|b| b.binding))
            .collect();
        bindings.sort_unstable();
        let expected: Vec<u32> = (0..kernel.binding_count()).collect();
        assert_eq!(bindings, expected, "Binding mismatch for {kernel:?}");
    }
}

#[test]
fn specialized_workgroup_sizes_validate() {
    for size in compute::resources::WORKGROUP_CANDIDATES {
        for kernel in [Kernel::CastRays, Kernel::Forward] {
            let module = validate(&specialize(kernel, size));
            assert_eq!(module.entry_points[0].workgroup_size, [size, 1, 1]);
        }
    }
}
