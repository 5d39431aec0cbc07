use burn::prelude::*;
use burn::tensor::activation::softplus;

/// Bayesian personalized ranking loss, `mean(softplus(-(pos - neg)))`.
///
/// `pos` is the row-wise dot product of source and positive embeddings.
/// With `shared_negatives`, every source is scored against every negative of
/// the batch (`x_src · x_negᵀ`, `[B, N]`) and the positive is broadcast along
/// the rows; otherwise row `i` is only compared with negative `i`.
pub fn bpr_loss<B: Backend>(
    x_src: Tensor<B, 2>,
    x_pos: Tensor<B, 2>,
    x_neg: Tensor<B, 2>,
    shared_negatives: bool,
) -> Tensor<B, 1> {
    let pos = (x_src.clone() * x_pos).sum_dim(1); // [B, 1]
    let margin = if shared_negatives {
        let neg = x_src.matmul(x_neg.transpose()); // [B, N]
        let n = neg.dims()[1];
        pos.repeat_dim(1, n) - neg
    } else {
        pos - (x_src * x_neg).sum_dim(1)
    };
    softplus(margin.neg(), 1.0).mean()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TB = NdArray;

    fn softplus_f64(x: f64) -> f64 {
        (1.0 + x.exp()).ln()
    }

    fn rows(data: &[[f32; 2]]) -> Vec<[f64; 2]> {
        data.iter().map(|r| [r[0] as f64, r[1] as f64]).collect()
    }

    const SRC: [[f32; 2]; 4] = [[1.0, 0.0], [0.0, 1.0], [0.5, 0.5], [-1.0, 2.0]];
    const POS: [[f32; 2]; 4] = [[2.0, 0.0], [0.0, 1.0], [1.0, -1.0], [0.0, 0.5]];
    const NEG: [[f32; 2]; 4] = [[0.0, 1.0], [1.0, 1.0], [-1.0, 0.0], [0.3, 0.3]];

    fn dot(a: [f64; 2], b: [f64; 2]) -> f64 {
        a[0] * b[0] + a[1] * b[1]
    }

    #[test]
    fn test_shared_negatives_average_all_pairs() {
        let device = Default::default();
        let loss = bpr_loss(
            Tensor::<TB, 2>::from_floats(SRC, &device),
            Tensor::<TB, 2>::from_floats(POS, &device),
            Tensor::<TB, 2>::from_floats(NEG, &device),
            true,
        );
        let (src, pos, neg) = (rows(&SRC), rows(&POS), rows(&NEG));
        let mut expected = 0.0;
        for i in 0..4 {
            for j in 0..4 {
                expected += softplus_f64(-(dot(src[i], pos[i]) - dot(src[i], neg[j])));
            }
        }
        expected /= 16.0;
        let got = loss.into_scalar().elem::<f64>();
        assert!((got - expected).abs() < 1e-5, "{got} vs {expected}");
    }

    #[test]
    fn test_independent_negatives_pair_rows() {
        let device = Default::default();
        let loss = bpr_loss(
            Tensor::<TB, 2>::from_floats(SRC, &device),
            Tensor::<TB, 2>::from_floats(POS, &device),
            Tensor::<TB, 2>::from_floats(NEG, &device),
            false,
        );
        let (src, pos, neg) = (rows(&SRC), rows(&POS), rows(&NEG));
        let expected: f64 = (0..4)
            .map(|i| softplus_f64(-(dot(src[i], pos[i]) - dot(src[i], neg[i]))))
            .sum::<f64>()
            / 4.0;
        let got = loss.into_scalar().elem::<f64>();
        assert!((got - expected).abs() < 1e-5, "{got} vs {expected}");
    }

    #[test]
    fn test_identical_scores_give_ln2() {
        let device = Default::default();
        let x = Tensor::<TB, 2>::from_floats([[1.0, 2.0], [3.0, 4.0]], &device);
        let loss = bpr_loss(x.clone(), x.clone(), x, false);
        assert!((loss.into_scalar().elem::<f64>() - 2f64.ln()).abs() < 1e-6);
    }
}
