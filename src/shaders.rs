// WGSL wrapper for elementwise kernels.
//
// A kernel is a plain WGSL function `fn entry(value: T, x: u32, y: u32) -> T`.
// It gets spliced into the template below, which binds the launch grid and
// both storage buffers and calls it once per element of the window.

const ELEMENT_PLACEHOLDER: &str = "{{ELEMENT}}";
const SOURCE_PLACEHOLDER: &str = "{{KERNEL_SOURCE}}";
const ENTRY_PLACEHOLDER: &str = "{{KERNEL_ENTRY}}";

/// Workgroup edge of the wrapper, in invocations.
pub const WORKGROUP_EDGE: u32 = 16;

pub const ELEMENTWISE_WRAPPER_SHADER: &str = r#"
struct LaunchGrid {
    dim_x: u32,
    dim_y: u32,
    x_start: u32,
    y_start: u32,
    x_end: u32,
    y_end: u32,
    _padding0: u32,
    _padding1: u32,
}

@group(0) @binding(0) var<uniform> grid: LaunchGrid;
@group(0) @binding(1) var<storage, read> input: array<{{ELEMENT}}>;
@group(0) @binding(2) var<storage, read_write> output: array<{{ELEMENT}}>;

{{KERNEL_SOURCE}}

@compute @workgroup_size(16, 16)
fn rs_main(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let x = grid.x_start + global_id.x;
    let y = grid.y_start + global_id.y;

    if (x >= grid.x_end || y >= grid.y_end) {
        return;
    }

    let index = y * grid.dim_x + x;
    output[index] = {{KERNEL_ENTRY}}(input[index], x, y);
}
"#;

/// Entry point of every generated module.
pub const WRAPPER_ENTRY_POINT: &str = "rs_main";

pub fn elementwise_shader(element: &str, source: &str, entry: &str) -> String {
    ELEMENTWISE_WRAPPER_SHADER
        .replace(ELEMENT_PLACEHOLDER, element)
        .replace(SOURCE_PLACEHOLDER, source)
        .replace(ENTRY_PLACEHOLDER, entry)
}
