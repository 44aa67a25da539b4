use bimm_contracts::assert_shape_contract;
use burn::backend::NdArray;
use burn::prelude::{Tensor, TensorData};
use detnet::error::DetNetError;
use detnet::models::detnet::detnet_model::{DetNet, DetNetConfig, DetNetMeta};
use detnet::models::detnet::prefabs::DetNetDepth;
use detnet::weights::WeightMap;

type B = NdArray<f32>;

fn assert_unit_range(output: &Tensor<B, 4>) {
    let min = output.clone().min().into_scalar();
    let max = output.clone().max().into_scalar();
    assert!((0.0..=1.0).contains(&min), "min {min} out of range");
    assert!((0.0..=1.0).contains(&max), "max {max} out of range");
}

fn is_norm_param(
    name: &str,
    leaf: &str,
) -> bool {
    let Some(owner) = name.strip_suffix(leaf) else {
        return false;
    };
    let owner = owner.trim_end_matches('.');
    let last = owner.rsplit('.').next().unwrap_or(owner);
    last.starts_with("bn") || owner.ends_with("downsample.1")
}

#[test]
fn test_resnet18_full_resolution_zero_batch() {
    let device = Default::default();
    let net: DetNet<B> = DetNetDepth::ResNet18.to_config().init(&device);

    let input = Tensor::<B, 4>::zeros([10, 4, 448, 448], &device);
    let output = net.forward(input);

    assert_shape_contract!(
        ["batch", "height", "width", "outputs"],
        &output,
        &[("batch", 10), ("height", 14), ("width", 14), ("outputs", 10)],
    );
    assert_unit_range(&output);
}

#[test]
fn test_grid_agrees_across_depths() {
    let device = Default::default();
    let input = Tensor::<B, 4>::zeros([1, 4, 64, 64], &device);

    let mut grids = Vec::new();
    for depth in DetNetDepth::ALL {
        let net: DetNet<B> = depth.to_config().init(&device);
        assert_eq!(net.output_resolution([448, 448]), [14, 14]);

        let output = net.forward(input.clone());
        assert_unit_range(&output);
        grids.push(output.dims());
    }

    assert!(grids.iter().all(|dims| *dims == [1, 2, 2, 10]), "{grids:?}");
}

#[test]
#[ignore = "full-resolution forward for every depth; slow on the ndarray backend"]
fn test_full_resolution_grid_per_depth() {
    let device = Default::default();
    let input = Tensor::<B, 4>::zeros([1, 4, 448, 448], &device);

    for depth in DetNetDepth::ALL {
        let net: DetNet<B> = depth.to_config().init(&device);
        let output = net.forward(input.clone());

        assert_eq!(output.dims(), [1, 14, 14, 10], "{depth}");
        assert_unit_range(&output);
    }
}

#[test]
fn test_fresh_norm_parameters() {
    let device = Default::default();
    for depth in [DetNetDepth::ResNet18, DetNetDepth::ResNet50] {
        let net: DetNet<B> = depth.to_config().init(&device);
        let weights = net.state_dict();

        let mut checked = 0;
        for (name, data) in weights.iter() {
            let expected = if is_norm_param(name, "weight") {
                1.0
            } else if is_norm_param(name, "bias") {
                0.0
            } else {
                continue;
            };
            let values = data.to_vec::<f32>().unwrap();
            assert!(values.iter().all(|v| *v == expected), "{depth}: {name}");
            checked += 1;
        }
        assert!(weights.contains("bn_end.weight"));
        assert!(weights.contains("layer5.0.downsample.1.bias"));
        assert!(checked > 0);
    }
}

#[test]
fn test_import_is_idempotent() {
    let device = Default::default();
    let config = DetNetConfig::new([1, 1, 1, 1], 512);
    let source = config.clone().init::<B>(&device).state_dict();

    let (once, report) = config
        .clone()
        .init::<B>(&device)
        .import_state_dict(&source)
        .unwrap();
    assert!(report.skipped.is_empty());
    assert!(report.missing.is_empty());

    let once_weights = once.state_dict();
    let (twice, _) = once.import_state_dict(&source).unwrap();
    let twice_weights = twice.state_dict();

    assert_eq!(
        once_weights.names().collect::<Vec<_>>(),
        twice_weights.names().collect::<Vec<_>>()
    );
    for (name, data) in once_weights.iter() {
        data.assert_eq(twice_weights.get(name).unwrap(), true);
        data.assert_eq(source.get(name).unwrap(), true);
    }
}

#[test]
fn test_import_is_selective() {
    let device = Default::default();
    let net: DetNet<B> = DetNetConfig::new([1, 1, 1, 1], 512).init(&device);
    let untouched = net.state_dict();

    let beta = TensorData::new(vec![0.25f32; 10], [10]);
    let weights = WeightMap::new()
        .with("bn_end.bias", beta.clone())
        .with("fc.weight", TensorData::new(vec![1.0f32; 2000], [2, 1000]));

    let (net, report) = net.import_state_dict(&weights).unwrap();
    assert_eq!(report.loaded, vec!["bn_end.bias".to_string()]);
    assert_eq!(report.skipped, vec!["fc.weight".to_string()]);

    let after = net.state_dict();
    after.get("bn_end.bias").unwrap().assert_eq(&beta, true);
    for (name, data) in untouched.iter().filter(|(name, _)| *name != "bn_end.bias") {
        data.assert_eq(after.get(name).unwrap(), true);
    }
}

#[test]
fn test_import_shape_mismatch() {
    let device = Default::default();
    let net: DetNet<B> = DetNetConfig::new([1, 1, 1, 1], 512).init(&device);

    let weights = WeightMap::new().with("conv1.weight", TensorData::new(vec![0.0f32; 64 * 3 * 49], [64, 3, 7, 7]));
    match net.import_state_dict(&weights) {
        Err(DetNetError::WeightShapeMismatch {
            name,
            expected,
            found,
        }) => {
            assert_eq!(name, "conv1.weight");
            assert_eq!(expected, vec![64, 4, 7, 7]);
            assert_eq!(found, vec![64, 3, 7, 7]);
        }
        other => panic!("unexpected {:?}", other.map(|(_, report)| report)),
    }
}

#[test]
fn test_construction_errors() {
    assert!(matches!(
        "resnet42".parse::<DetNetDepth>(),
        Err(DetNetError::UnsupportedDepth { .. })
    ));

    let err = DetNetConfig::new([2, 2, 2, 2], 2048)
        .try_init::<B>(&Default::default())
        .unwrap_err();
    assert!(err.to_string().starts_with("channel mismatch in"), "{err}");
}
