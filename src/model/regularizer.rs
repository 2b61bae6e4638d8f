use burn::prelude::*;

/// Orthogonal regularisation penalty `scale * sum((WᵀW - I)²) / 2`.
///
/// All axes but the last are flattened, so a `[h, w, in, out]` kernel becomes
/// a `[h * w * in, out]` matrix and a `[in, out]` dense weight is used as is.
/// The result is a differentiable `[1]` tensor that can be added to a loss.
pub fn orthogonal_penalty<B: Backend, const D: usize>(weight: Tensor<B, D>, scale: f64) -> Tensor<B, 1> {
    let columns = weight.dims()[D - 1];
    let rows = weight.shape().num_elements() / columns;
    let matrix = weight.reshape([rows, columns]);
    let identity = Tensor::<B, 2>::eye(columns, &matrix.device());

    let gram = matrix.clone().transpose().matmul(matrix);
    (gram - identity)
        .powf_scalar(2.0)
        .sum()
        .mul_scalar(scale / 2.0)
}
