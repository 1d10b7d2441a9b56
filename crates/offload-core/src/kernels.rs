//! OpenCL kernel sources and matching CPU reference implementations.
//!
//! The simulated runtime executes the reference implementations, so results
//! from a simulated run and a native OpenCL run are directly comparable.

/// Square matrix multiply: `output = matrix1 × matrix2`. Three buffer
/// arguments (two inputs, one output).
pub const MATRIX_MULT: &str = "matrix_mult";

/// Square matrix square: `output = matrix × matrix`. Two buffer arguments.
pub const MATRIX_SQR: &str = "matrix_sqr";

/// Kernel names in [`KERNEL_SOURCE`].
pub const KERNEL_NAMES: &[&str] = &[MATRIX_MULT, MATRIX_SQR];

/// OpenCL C source of all benchmark kernels.
///
/// Both kernels run over a 2D range `[D, D]` and read the dimension from
/// `get_global_size(0)`.
pub const KERNEL_SOURCE: &str = r#"
__kernel void matrix_mult(__global float* matrix1,
                          __global float* matrix2,
                          __global float* output) {
    size_t size = get_global_size(0);
    size_t x = get_global_id(0);
    size_t y = get_global_id(1);
    float result = 0;
    for (size_t idx = 0; idx < size; ++idx) {
        result += matrix1[idx + y * size] * matrix2[x + idx * size];
    }
    output[x + y * size] = result;
}

__kernel void matrix_sqr(__global float* matrix,
                         __global float* output) {
    size_t size = get_global_size(0);
    size_t x = get_global_id(0);
    size_t y = get_global_id(1);
    float result = 0;
    for (size_t idx = 0; idx < size; ++idx) {
        result += matrix[idx + y * size] * matrix[x + idx * size];
    }
    output[x + y * size] = result;
}
"#;

/// Number of buffer arguments `name` takes, or `None` for an unknown kernel.
pub fn arg_count(name: &str) -> Option<usize> {
    match name {
        MATRIX_MULT => Some(3),
        MATRIX_SQR => Some(2),
        _ => None,
    }
}

/// CPU reference for `matrix_mult` over a `size × size` range.
///
/// All slices must hold at least `size * size` elements.
pub fn matrix_mult_ref(lhs: &[f32], rhs: &[f32], out: &mut [f32], size: usize) {
    for y in 0..size {
        for x in 0..size {
            let mut acc = 0.0f32;
            for idx in 0..size {
                acc += lhs[idx + y * size] * rhs[x + idx * size];
            }
            out[x + y * size] = acc;
        }
    }
}

/// CPU reference for `matrix_sqr`.
pub fn matrix_sqr_ref(matrix: &[f32], out: &mut [f32], size: usize) {
    matrix_mult_ref(matrix, matrix, out, size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_defines_every_named_kernel() {
        for name in KERNEL_NAMES {
            assert!(KERNEL_SOURCE.contains(&format!("__kernel void {name}(")), "missing {name}");
            assert!(arg_count(name).is_some());
        }
        assert_eq!(arg_count("cpy_3d"), None);
    }

    #[test]
    fn identity_times_matrix_is_matrix() {
        let identity = [1.0, 0.0, 0.0, 1.0];
        let m = [1.0, 2.0, 3.0, 4.0];
        let mut out = [0.0; 4];
        matrix_mult_ref(&identity, &m, &mut out, 2);
        assert_eq!(out, m);
    }

    #[test]
    fn sequential_fill_product_2x2() {
        // [[0,1],[2,3]]^2 = [[2,3],[6,11]]
        let m = [0.0, 1.0, 2.0, 3.0];
        let mut out = [0.0; 4];
        matrix_sqr_ref(&m, &mut out, 2);
        assert_eq!(out, [2.0, 3.0, 6.0, 11.0]);
    }
}
