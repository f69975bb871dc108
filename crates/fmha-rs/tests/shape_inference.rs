use anyhow::Result;
use fmha_rs::{infer_backward, infer_forward, DType, TensorDescriptor, ValidationError};

fn desc(dtype: DType, dims: &[usize]) -> TensorDescriptor {
    TensorDescriptor::new(dtype, dims)
}

#[test]
fn forward_output_follows_query_and_activation_is_bhqk() -> Result<()> {
    let q = desc(DType::Bf16, &[2, 128, 4, 64]);
    let k = desc(DType::Bf16, &[2, 96, 4, 64]);
    let v = desc(DType::Bf16, &[2, 96, 4, 64]);

    let (output, activation) = infer_forward(&q, &k, &v)?;
    assert_eq!(output, q);
    assert_eq!(activation, desc(DType::Bf16, &[2, 4, 128, 96]));
    Ok(())
}

#[test]
fn backward_gradients_mirror_forward_inputs() -> Result<()> {
    let q = desc(DType::F16, &[1, 16, 2, 32]);
    let k = desc(DType::F16, &[1, 8, 2, 32]);
    let v = desc(DType::F16, &[1, 8, 2, 32]);
    let (output, activation) = infer_forward(&q, &k, &v)?;

    let (dq, dk, dv) = infer_backward(&output, &q, &k, &v, &activation)?;
    assert_eq!((dq, dk, dv), (q, k, v));
    Ok(())
}

#[test]
fn rank_is_checked_first() {
    let q = desc(DType::F32, &[2, 128, 64]);
    let k = desc(DType::Bf16, &[2, 128, 4, 64]);
    let err = infer_forward(&q, &k, &k).unwrap_err();
    assert_eq!(
        err,
        ValidationError::Rank {
            operator: "dot_product_attention_fwd",
            operand: "query",
            expected: 4,
            found: 3,
        }
    );
}

#[test]
fn unsupported_dtypes_are_rejected() {
    for dtype in [DType::F32, DType::F64, DType::Si32, DType::Fp8E4M3] {
        let t = desc(dtype, &[1, 4, 1, 8]);
        let err = infer_forward(&t, &t, &t).unwrap_err();
        assert!(
            matches!(err, ValidationError::UnsupportedDtype { operand: "query", dtype: d, .. } if d == dtype),
            "{dtype:?}: {err}"
        );
    }
}

#[test]
fn mixed_dtypes_are_rejected() {
    let q = desc(DType::Bf16, &[1, 4, 1, 8]);
    let k = desc(DType::F16, &[1, 4, 1, 8]);
    let err = infer_forward(&q, &k, &q).unwrap_err();
    assert!(matches!(
        err,
        ValidationError::UnsupportedDtype {
            operand: "key",
            dtype: DType::F16,
            ..
        }
    ));
}

#[test]
fn axis_disagreements_are_shape_mismatches() {
    let q = desc(DType::F16, &[2, 16, 4, 32]);
    let cases = [
        ("batch", desc(DType::F16, &[3, 8, 4, 32]), desc(DType::F16, &[3, 8, 4, 32])),
        ("head count", desc(DType::F16, &[2, 8, 2, 32]), desc(DType::F16, &[2, 8, 2, 32])),
        ("sequence length", desc(DType::F16, &[2, 8, 4, 32]), desc(DType::F16, &[2, 9, 4, 32])),
        ("head dim", desc(DType::F16, &[2, 8, 4, 16]), desc(DType::F16, &[2, 8, 4, 16])),
    ];
    for (what, k, v) in cases {
        match infer_forward(&q, &k, &v) {
            Err(ValidationError::ShapeMismatch { detail, .. }) => {
                assert!(detail.starts_with(what), "expected {what}, got {detail}");
            }
            other => panic!("{what}: unexpected {other:?}"),
        }
    }
}

#[test]
fn zero_length_axis_is_rejected() {
    let q = desc(DType::Bf16, &[2, 0, 4, 64]);
    let k = desc(DType::Bf16, &[2, 8, 4, 64]);
    let err = infer_forward(&q, &k, &k).unwrap_err();
    assert!(matches!(err, ValidationError::ShapeMismatch { .. }), "{err}");
}

#[test]
fn backward_rejects_mismatched_gradient_and_activation() -> Result<()> {
    let q = desc(DType::Bf16, &[2, 16, 4, 32]);
    let k = desc(DType::Bf16, &[2, 24, 4, 32]);
    let (output, activation) = infer_forward(&q, &k, &k)?;

    let bad_grad = desc(DType::Bf16, &[2, 16, 4, 16]);
    let err = infer_backward(&bad_grad, &q, &k, &k, &activation).unwrap_err();
    assert!(matches!(err, ValidationError::ShapeMismatch { .. }));

    let transposed = desc(DType::Bf16, &[2, 4, 24, 16]);
    let err = infer_backward(&output, &q, &k, &k, &transposed).unwrap_err();
    assert!(matches!(err, ValidationError::ShapeMismatch { .. }));

    let wrong_dtype = desc(DType::F16, &[2, 16, 4, 32]);
    let err = infer_backward(&wrong_dtype, &q, &k, &k, &activation).unwrap_err();
    assert!(matches!(
        err,
        ValidationError::UnsupportedDtype {
            operand: "grad_output",
            ..
        }
    ));

    let flat_activation = desc(DType::Bf16, &[2, 4, 16 * 24]);
    let err = infer_backward(&output, &q, &k, &k, &flat_activation).unwrap_err();
    assert!(matches!(
        err,
        ValidationError::Rank {
            operand: "activation",
            found: 3,
            ..
        }
    ));
    Ok(())
}

#[test]
fn descriptors_render_compactly() {
    let d = desc(DType::Bf16, &[2, 128, 4, 64]);
    assert_eq!(d.to_string(), "bf16[2,128,4,64]");
    assert_eq!(d.byte_len(), Some(2 * 128 * 4 * 64 * 2));
}
