//! Loss function(s)
//!
//! All losses take raw discriminator logits and are averaged over the batch.

use crate::tensor::{Tensor, TensorError};

/// Binary cross-entropy between `sigmoid(logits)` and a constant target, computed directly from
/// the logits for numerical stability
pub struct BCEWithLogitsLoss;

impl BCEWithLogitsLoss {
    pub fn call(logits: &Tensor, target: f32) -> Result<Tensor, TensorError> {
        logits.bce_with_logits(target)
    }
}

/// The generator is rewarded when the discriminator calls its images real
pub fn generator_loss(fake_logits: &Tensor) -> Result<Tensor, TensorError> {
    BCEWithLogitsLoss::call(fake_logits, 1.0)
}

/// How far the discriminator is from calling real images real
pub fn discriminator_real_term(real_logits: &Tensor) -> Result<Tensor, TensorError> {
    BCEWithLogitsLoss::call(real_logits, 1.0)
}

/// How far the discriminator is from calling generated images fake
pub fn discriminator_fake_term(fake_logits: &Tensor) -> Result<Tensor, TensorError> {
    BCEWithLogitsLoss::call(fake_logits, 0.0)
}

pub fn discriminator_loss(real_logits: &Tensor, fake_logits: &Tensor) -> Result<Tensor, TensorError> {
    discriminator_real_term(real_logits)?.add(&discriminator_fake_term(fake_logits)?)
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::assert_eq_float;

    fn logits(values: &[f32]) -> Tensor {
        Tensor::new(values.to_vec(), &[values.len(), 1]).unwrap()
    }

    #[test]
    fn test_known_values() {
        let undecided = logits(&[0.0, 0.0, 0.0]);
        let ln2 = 2.0f32.ln();
        assert_eq_float!(generator_loss(&undecided).unwrap().item().unwrap(), ln2);
        assert_eq_float!(
            discriminator_loss(&undecided, &undecided)
                .unwrap()
                .item()
                .unwrap(),
            2.0 * ln2
        );

        // -ln(sigmoid(2)) and -ln(1 - sigmoid(2)) averaged
        let mixed = logits(&[2.0, -2.0]);
        let expected = ((1.0 + (-2.0f32).exp()).ln() + (1.0 + 2.0f32.exp()).ln()) / 2.0;
        assert_eq_float!(generator_loss(&mixed).unwrap().item().unwrap(), expected);
    }

    #[test]
    fn test_losses_are_non_negative() {
        let mut rng = Pcg64Mcg::seed_from_u64(11);
        for _ in 0..50 {
            let values = (0..8)
                .map(|_| rng.random_range(-50.0..50.0))
                .collect::<Vec<f32>>();
            let batch = logits(&values);
            assert!(generator_loss(&batch).unwrap().item().unwrap() >= 0.0);
            assert!(discriminator_loss(&batch, &batch).unwrap().item().unwrap() >= 0.0);
        }
    }

    #[test]
    fn test_discriminator_loss_decomposes() {
        let real = logits(&[3.0, -1.0, 0.5]);
        let fake = logits(&[-4.0, 2.0, 0.0]);
        let total = discriminator_loss(&real, &fake).unwrap().item().unwrap();
        let real_term = discriminator_real_term(&real).unwrap().item().unwrap();
        let fake_term = discriminator_fake_term(&fake).unwrap().item().unwrap();
        assert_eq_float!(total, real_term + fake_term);

        // changing the fake batch leaves the real term untouched
        let other_fake = logits(&[1.0, 1.0, 1.0]);
        let other_total = discriminator_loss(&real, &other_fake).unwrap().item().unwrap();
        let other_fake_term = discriminator_fake_term(&other_fake).unwrap().item().unwrap();
        assert_eq_float!(other_total - other_fake_term, real_term);
    }

    #[test]
    fn test_stable_for_extreme_logits() {
        let extreme = logits(&[-1e4, 1e4]);
        let loss = generator_loss(&extreme).unwrap().item().unwrap();
        assert!(loss.is_finite());
        assert_eq_float!(loss, 5e3);
    }

    #[test]
    fn test_empty_batch() {
        let empty = Tensor::new(vec![], &[0, 1]).unwrap();
        assert!(matches!(
            generator_loss(&empty),
            Err(TensorError::Empty { .. })
        ));
    }
}
