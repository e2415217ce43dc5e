use gpt_pipe::{CrossEntropyLoss, Shape, Tensor};

fn logits_2x2() -> Tensor {
    // Row 0 is uniform; row 1 strongly prefers index 0.
    Tensor::from_vec(Shape::new([1, 2, 2]), vec![0.0, 0.0, 10.0, 0.0]).unwrap()
}

fn labels(values: &[i32]) -> Tensor {
    Tensor::from_i32(Shape::new([1, values.len()]), values.to_vec()).unwrap()
}

fn mask(values: &[f32]) -> Tensor {
    Tensor::from_vec(Shape::new([1, values.len()]), values.to_vec()).unwrap()
}

#[test]
fn masked_mean_matches_hand_computed_values() {
    let loss = CrossEntropyLoss::new(false);
    let value = loss
        .compute(&logits_2x2(), &labels(&[0, 1]), &mask(&[1.0, 1.0]))
        .unwrap();

    let row0 = 2.0f32.ln();
    let row1 = (10.0f32.exp() + 1.0).ln();
    let expected = (row0 + row1) / 2.0;
    assert!((value - expected).abs() < 1e-4, "got {value}, want {expected}");
}

#[test]
fn zero_mask_entries_do_not_contribute() {
    let loss = CrossEntropyLoss::new(false);
    let value = loss
        .compute(&logits_2x2(), &labels(&[0, 1]), &mask(&[1.0, 0.0]))
        .unwrap();
    assert!((value - 2.0f32.ln()).abs() < 1e-6);
}

#[test]
fn an_all_zero_mask_is_an_error() {
    let loss = CrossEntropyLoss::new(false);
    assert!(loss
        .compute(&logits_2x2(), &labels(&[0, 1]), &mask(&[0.0, 0.0]))
        .is_err());
}

#[test]
fn out_of_range_labels_are_reported() {
    let loss = CrossEntropyLoss::new(false);
    assert!(loss
        .compute(&logits_2x2(), &labels(&[0, 7]), &mask(&[1.0, 1.0]))
        .is_err());
}

#[test]
fn mismatched_mask_length_is_reported() {
    let loss = CrossEntropyLoss::new(false);
    assert!(loss
        .compute(&logits_2x2(), &labels(&[0, 1]), &mask(&[1.0]))
        .is_err());
}
