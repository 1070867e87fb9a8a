mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use common::{SpyKernel, HEADS, HEAD_SIZE, HIDDEN};
use encoder::{
    EncoderConfig, EncoderError, EncoderModule, InputArgument, KernelError, Precision, WeightName,
    WeightProperty,
};

fn spy_module(
    remove_padding: bool,
    fail: bool,
) -> Result<(EncoderModule<SpyKernel>, Arc<AtomicUsize>)> {
    let drops = Arc::new(AtomicUsize::new(0));
    let counter = drops.clone();
    let module = EncoderModule::with_kernel(
        common::config(remove_padding),
        common::weights(DType::F32)?,
        move |precision, _, _| Ok(SpyKernel::new(precision, counter, fail)),
    )?;
    Ok((module, drops))
}

fn expect_invalid_input(result: encoder::Result<Tensor>, expected: InputArgument) {
    match result {
        Err(EncoderError::InvalidInput { argument, .. }) => assert_eq!(argument, expected),
        Err(other) => panic!("expected InvalidInput for {expected}, got {other}"),
        Ok(_) => panic!("expected InvalidInput for {expected}, got a result"),
    }
}

#[test]
fn state_returns_inputs_by_identity() -> Result<()> {
    for remove_padding in [false, true] {
        let weights = common::weights(DType::F32)?;
        let ids: Vec<_> = weights.iter().map(Tensor::id).collect();
        let module = EncoderModule::new(common::config(remove_padding), weights)?;

        let state = module.get_state();
        assert_eq!(state.len(), 17);
        let state_ids: Vec<_> = state[..16].iter().map(Tensor::id).collect();
        assert_eq!(state_ids, ids);
        assert_eq!(
            state[16].to_vec1::<i64>()?,
            vec![HEADS as i64, HEAD_SIZE as i64, i64::from(remove_padding)]
        );
        assert_eq!(module.precision(), Precision::Float32);
        assert_eq!(module.hidden_dim(), HIDDEN);
    }
    Ok(())
}

#[test]
fn half_precision_selects_half_kernel() -> Result<()> {
    let module = EncoderModule::new(common::config(false), common::weights(DType::F16)?)?;
    assert_eq!(module.precision(), Precision::Float16);
    assert_eq!(module.dtype(), DType::F16);

    let input = common::input(2, 4, DType::F16)?;
    let mask = common::mask(&[4, 4], 4, DType::F16)?;
    let output = module.forward(&input, &mask, None)?;
    assert_eq!(output.dims(), &[2, 4, HIDDEN]);
    assert_eq!(output.dtype(), DType::F16);
    Ok(())
}

#[test]
fn mismatched_weight_dtype_names_the_tensor() -> Result<()> {
    for name in [WeightName::QBias, WeightName::InterKernel, WeightName::OutLnBeta] {
        let mut weights = common::weights(DType::F32)?;
        let slot = &mut weights[name.index()];
        *slot = slot.to_dtype(DType::F16)?;

        match EncoderModule::new(common::config(false), weights) {
            Err(EncoderError::InvalidWeight {
                name: failed,
                property,
                ..
            }) => {
                assert_eq!(failed, name);
                assert_eq!(property, WeightProperty::DType);
            }
            other => panic!("expected InvalidWeight for {name}, got {other:?}"),
        }
    }
    Ok(())
}

#[test]
fn unsupported_precision_is_rejected() -> Result<()> {
    for dtype in [DType::BF16, DType::F64] {
        let weights = common::weights(dtype)?;
        match EncoderModule::new(common::config(false), weights) {
            Err(EncoderError::UnsupportedPrecision { dtype: found }) => assert_eq!(found, dtype),
            other => panic!("expected UnsupportedPrecision for {dtype:?}, got {other:?}"),
        }
    }
    Ok(())
}

#[test]
fn strided_or_misshapen_weights_are_rejected() -> Result<()> {
    let mut weights = common::weights(DType::F32)?;
    weights[WeightName::AttnOutKernel.index()] =
        Tensor::zeros((HIDDEN, HIDDEN), DType::F32, &Device::Cpu)?.t()?;
    assert!(matches!(
        EncoderModule::new(common::config(false), weights),
        Err(EncoderError::InvalidWeight {
            name: WeightName::AttnOutKernel,
            property: WeightProperty::Contiguity,
            ..
        })
    ));

    let mut weights = common::weights(DType::F32)?;
    weights[WeightName::InterBias.index()] = Tensor::zeros(HIDDEN, DType::F32, &Device::Cpu)?;
    let err = EncoderModule::new(common::config(false), weights).unwrap_err();
    assert!(matches!(
        err,
        EncoderError::InvalidWeight {
            name: WeightName::InterBias,
            property: WeightProperty::Shape,
            ..
        }
    ));
    assert!(err.to_string().contains("inter_bias"));
    Ok(())
}

#[test]
fn empty_heads_are_an_invalid_config() -> Result<()> {
    let weights = common::weights(DType::F32)?;
    assert!(matches!(
        EncoderModule::new(EncoderConfig::new(0, HEAD_SIZE, false), weights),
        Err(EncoderError::InvalidConfig(_))
    ));
    Ok(())
}

#[test]
fn oversized_head_counts_are_an_invalid_config() -> Result<()> {
    for config in [
        EncoderConfig::new(1 << 62, 1, false),
        EncoderConfig::new(usize::MAX, 1, true),
    ] {
        assert!(matches!(
            EncoderModule::new(config, common::weights(DType::F32)?),
            Err(EncoderError::InvalidConfig(_))
        ));
    }
    Ok(())
}

#[test]
fn dense_scenario_produces_input_shape() -> Result<()> {
    let module = EncoderModule::new(common::config(false), common::weights(DType::F32)?)?;
    let input = common::input(2, 4, DType::F32)?;
    let mask = common::mask(&[4, 4], 4, DType::F32)?;

    let first = module.forward(&input, &mask, None)?;
    assert_eq!(first.dims(), &[2, 4, 128]);
    assert_eq!(first.dtype(), DType::F32);

    let second = module.forward(&input, &mask, None)?;
    assert_eq!(
        first.flatten_all()?.to_vec1::<f32>()?,
        second.flatten_all()?.to_vec1::<f32>()?
    );
    Ok(())
}

#[test]
fn dense_mode_ignores_sequence_lengths() -> Result<()> {
    let module = EncoderModule::new(common::config(false), common::weights(DType::F32)?)?;
    let input = common::input(2, 4, DType::F32)?;
    let mask = common::mask(&[4, 4], 4, DType::F32)?;

    let without = module.forward(&input, &mask, None)?;
    let bogus = Tensor::new(&[1.5f32], &Device::Cpu)?;
    let with = module.forward(&input, &mask, Some(&bogus))?;
    assert_eq!(common::max_abs_diff(&without, &with)?, 0.0);
    Ok(())
}

#[test]
fn padding_removal_scenario() -> Result<()> {
    let module = EncoderModule::new(common::config(true), common::weights(DType::F32)?)?;
    let input = common::input(2, 4, DType::F32)?;
    let mask = common::mask(&[4, 2], 4, DType::F32)?;

    let output = module.forward(&input, &mask, Some(&common::lengths(&[4, 2])?))?;
    assert_eq!(output.dims(), &[2, 4, HIDDEN]);

    expect_invalid_input(
        module.forward(&input, &mask, Some(&common::lengths(&[4])?)),
        InputArgument::SequenceLengths,
    );
    Ok(())
}

#[test]
fn padding_removal_matches_dense_within_lengths() -> Result<()> {
    let weights = common::weights(DType::F32)?;
    let dense = EncoderModule::new(common::config(false), weights.clone())?;
    let packed = EncoderModule::new(common::config(true), weights)?;

    let lengths = [5usize, 1, 3];
    let input = common::input(3, 5, DType::F32)?;
    let mask = common::mask(&lengths, 5, DType::F32)?;
    let lengths_tensor = Tensor::new(&[5i64, 1, 3], &Device::Cpu)?;

    let expected = dense.forward(&input, &mask, None)?;
    let actual = packed.forward(&input, &mask, Some(&lengths_tensor))?;
    for (batch, &len) in lengths.iter().enumerate() {
        let diff = common::max_abs_diff(
            &expected.get(batch)?.narrow(0, 0, len)?,
            &actual.get(batch)?.narrow(0, 0, len)?,
        )?;
        assert!(diff < 1e-4, "batch {batch} diff {diff}");
    }
    Ok(())
}

#[test]
fn sequences_do_not_depend_on_batch_neighbours() -> Result<()> {
    let module = EncoderModule::new(common::config(true), common::weights(DType::F32)?)?;
    let first = common::input(1, 4, DType::F32)?;
    let second = common::input(1, 4, DType::F32)?;

    let alone = module.forward(
        &first,
        &common::mask(&[3], 4, DType::F32)?,
        Some(&common::lengths(&[3])?),
    )?;
    let together = module.forward(
        &Tensor::cat(&[&first, &second], 0)?,
        &common::mask(&[3, 4], 4, DType::F32)?,
        Some(&common::lengths(&[3, 4])?),
    )?;
    let diff = common::max_abs_diff(
        &alone.get(0)?.narrow(0, 0, 3)?,
        &together.get(0)?.narrow(0, 0, 3)?,
    )?;
    assert!(diff < 1e-5, "diff {diff}");
    Ok(())
}

#[test]
fn zero_length_sequences_are_accepted() -> Result<()> {
    let module = EncoderModule::new(common::config(true), common::weights(DType::F32)?)?;
    let input = common::input(3, 4, DType::F32)?;
    let mask = common::mask(&[0, 4, 2], 4, DType::F32)?;
    let output = module.forward(&input, &mask, Some(&common::lengths(&[0, 4, 2])?))?;
    assert_eq!(output.dims(), &[3, 4, HIDDEN]);
    Ok(())
}

#[test]
fn malformed_lengths_never_reach_the_kernel() -> Result<()> {
    let (module, _) = spy_module(true, false)?;
    let input = common::input(2, 4, DType::F32)?;
    let mask = common::mask(&[4, 2], 4, DType::F32)?;
    let device = Device::Cpu;

    let cases = [
        None,
        Some(Tensor::zeros(0, DType::U32, &device)?),
        Some(common::lengths(&[4])?),
        Some(common::lengths(&[4, 2, 1])?),
        Some(Tensor::new(&[4f32, 2.], &device)?),
        Some(Tensor::new(&[[4u32, 2]], &device)?),
        Some(common::lengths(&[5, 2])?),
        Some(Tensor::new(&[4i64, -1], &device)?),
    ];
    for lengths in &cases {
        expect_invalid_input(
            module.forward(&input, &mask, lengths.as_ref()),
            InputArgument::SequenceLengths,
        );
    }
    assert_eq!(module.kernel().calls(), 0);

    module.forward(&input, &mask, Some(&common::lengths(&[4, 2])?))?;
    assert_eq!(module.kernel().calls(), 1);
    Ok(())
}

#[test]
fn malformed_inputs_and_masks_are_rejected() -> Result<()> {
    let (module, _) = spy_module(false, false)?;
    let device = Device::Cpu;
    let input = common::input(2, 4, DType::F32)?;
    let mask = common::mask(&[4, 4], 4, DType::F32)?;

    expect_invalid_input(
        module.forward(&input.to_dtype(DType::F16)?, &mask, None),
        InputArgument::Input,
    );
    expect_invalid_input(
        module.forward(&Tensor::zeros((4, 2, HIDDEN), DType::F32, &device)?.transpose(0, 1)?, &mask, None),
        InputArgument::Input,
    );
    expect_invalid_input(
        module.forward(&Tensor::zeros((2, 4, HIDDEN + 1), DType::F32, &device)?, &mask, None),
        InputArgument::Input,
    );
    expect_invalid_input(
        module.forward(&Tensor::zeros((8, HIDDEN), DType::F32, &device)?, &mask, None),
        InputArgument::Input,
    );
    expect_invalid_input(
        module.forward(&Tensor::zeros((0, 4, HIDDEN), DType::F32, &device)?, &mask, None),
        InputArgument::Input,
    );
    expect_invalid_input(
        module.forward(&input, &mask.to_dtype(DType::F16)?, None),
        InputArgument::AttentionMask,
    );
    expect_invalid_input(
        module.forward(&input, &mask.transpose(1, 2)?, None),
        InputArgument::AttentionMask,
    );
    expect_invalid_input(
        module.forward(&input, &common::mask(&[4, 4], 3, DType::F32)?, None),
        InputArgument::AttentionMask,
    );
    assert_eq!(module.kernel().calls(), 0);
    Ok(())
}

#[test]
fn forward_leaves_arguments_untouched() -> Result<()> {
    let module = EncoderModule::new(common::config(true), common::weights(DType::F32)?)?;
    let input = common::input(2, 4, DType::F32)?;
    let mask = common::mask(&[4, 3], 4, DType::F32)?;
    let lengths = common::lengths(&[4, 3])?;
    let before = (
        input.flatten_all()?.to_vec1::<f32>()?,
        mask.flatten_all()?.to_vec1::<f32>()?,
        module.weights().get(WeightName::QKernel).flatten_all()?.to_vec1::<f32>()?,
    );

    module.forward(&input, &mask, Some(&lengths))?;

    assert_eq!(input.flatten_all()?.to_vec1::<f32>()?, before.0);
    assert_eq!(mask.flatten_all()?.to_vec1::<f32>()?, before.1);
    assert_eq!(
        module.weights().get(WeightName::QKernel).flatten_all()?.to_vec1::<f32>()?,
        before.2
    );
    assert_eq!(lengths.to_vec1::<u32>()?, vec![4, 3]);
    Ok(())
}

#[test]
fn kernel_failures_propagate_and_module_survives() -> Result<()> {
    let (module, drops) = spy_module(false, true)?;
    let input = common::input(1, 2, DType::F32)?;
    let mask = common::mask(&[2], 2, DType::F32)?;

    for attempt in 1..=2 {
        match module.forward(&input, &mask, None) {
            Err(EncoderError::KernelFailure(KernelError::Unsupported(message))) => {
                assert!(message.contains("refused"));
            }
            other => panic!("expected KernelFailure, got {other:?}"),
        }
        assert_eq!(module.kernel().calls(), attempt);
    }
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(module);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn kernel_is_released_exactly_once() -> Result<()> {
    let (module, drops) = spy_module(false, false)?;
    let input = common::input(2, 3, DType::F32)?;
    let mask = common::mask(&[3, 3], 3, DType::F32)?;
    for _ in 0..3 {
        let output = module.forward(&input, &mask, None)?;
        assert_eq!(common::max_abs_diff(&output, &input)?, 0.0);
    }
    let _ = module.forward(&input.to_dtype(DType::F16)?, &mask, None);
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    drop(module);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn failed_construction_never_builds_a_kernel() -> Result<()> {
    let built = Arc::new(AtomicUsize::new(0));
    let mut weights = common::weights(DType::F32)?;
    weights[WeightName::VKernel.index()] = weights[WeightName::VKernel.index()].to_dtype(DType::F16)?;

    let counter = built.clone();
    let result = EncoderModule::with_kernel(common::config(false), weights, move |precision, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(SpyKernel::new(precision, Arc::new(AtomicUsize::new(0)), false))
    });
    assert!(result.is_err());
    assert_eq!(built.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn factory_errors_surface_as_kernel_failures() -> Result<()> {
    let result = EncoderModule::<SpyKernel>::with_kernel(
        common::config(false),
        common::weights(DType::F32)?,
        |_, _, _| Err(KernelError::Unsupported("no backend".to_string())),
    );
    assert!(matches!(result, Err(EncoderError::KernelFailure(_))));
    Ok(())
}
