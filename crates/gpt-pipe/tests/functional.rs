use gpt_pipe::ops::functional;
use gpt_pipe::pipe::causal_mask;
use gpt_pipe::{Shape, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn transpose01_round_trips() {
    let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
    let x = Tensor::from_vec(Shape::new([2, 3, 4]), data.clone()).unwrap();
    let twice = functional::transpose01(&functional::transpose01(&x).unwrap()).unwrap();
    assert_eq!(twice.shape().dims(), &[2, 3, 4]);
    assert_eq!(twice.data(), data.as_slice());
}

#[test]
fn softmax_rows_sum_to_one() {
    let x = Tensor::from_vec(Shape::new([2, 3]), vec![1.0, 2.0, 3.0, -5.0, 0.0, 5.0]).unwrap();
    let y = functional::softmax_last_axis(&x).unwrap();
    for row in y.data().chunks(3) {
        let sum: f32 = row.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }
}

#[test]
fn causal_mask_blocks_exactly_the_future() {
    let mask = causal_mask(3, 3).unwrap();
    let m = mask.data_bool();
    // row i may see columns 0..=i
    assert_eq!(
        m,
        &[false, true, true, false, false, true, false, false, false]
    );

    // A single fresh query over history plus itself sees everything.
    let step = causal_mask(1, 4).unwrap();
    assert!(step.data_bool().iter().all(|&blocked| !blocked));
}

#[test]
fn masked_positions_do_not_influence_earlier_outputs() {
    let mut rng = StdRng::seed_from_u64(11);
    let h = 4;
    let w_qkv = Tensor::randn(Shape::new([h, 3 * h]), 0.1, &mut rng);
    let b_qkv = Tensor::zeros(Shape::new([3 * h]));
    let w_out = Tensor::randn(Shape::new([h, h]), 0.1, &mut rng);
    let b_out = Tensor::zeros(Shape::new([h]));
    let mask = causal_mask(2, 2).unwrap();

    let base = vec![0.5, -0.25, 0.75, 0.1, 0.0, 0.0, 0.0, 0.0];
    let mut changed = base.clone();
    changed[4] = 9.0;
    changed[7] = -3.0;

    let run = |data: Vec<f32>| {
        let x = Tensor::from_vec(Shape::new([2, 1, h]), data).unwrap();
        functional::causal_attention(
            &x, 2, &w_qkv, &b_qkv, &w_out, &b_out, &mask, -10000.0, None,
        )
        .unwrap()
    };
    let a = run(base);
    let b = run(changed);

    // Position 0 attends only to itself, so editing position 1 cannot move it.
    assert_eq!(&a.output.data()[..h], &b.output.data()[..h]);
    assert_eq!(a.present.len(), 2);
}
