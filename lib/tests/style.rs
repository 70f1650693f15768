mod common;

use neural_style::{
    image,
    network::{FileLoader, NetworkLoader, PoolMethod},
    style_image, Animation, Error, StyleConfig,
};
use std::path::Path;

fn config(dir: &Path) -> StyleConfig {
    let subject = dir.join("subject.png");
    let style = dir.join("style.png");
    common::gradient_image(16, 12).save(&subject).unwrap();
    common::checker_image(10, 10).save(&style).unwrap();

    StyleConfig {
        subject,
        style,
        output: dir.join("out").join("styled.png"),
        animation: None,
        iterations: 5,
        learn_rate: 1.0,
        subject_weights: common::subject_weights(),
        style_weights: common::style_weights(),
        ..StyleConfig::default()
    }
}

#[test]
fn styles_an_image() {
    let dir = tempfile::tempdir().unwrap();
    let network = FileLoader::new(common::save_tiny_network(dir.path()))
        .load(PoolMethod::Avg)
        .unwrap();

    let config = StyleConfig {
        animation: Some(Animation {
            directory: dir.path().join("animation"),
            rate: 2,
        }),
        ..config(dir.path())
    };

    style_image(&config, &network, None).unwrap();

    let styled = image::open(&config.output).unwrap().to_rgb8();
    assert_eq!(styled.dimensions(), (16, 12));

    assert_eq!(
        common::file_names(&dir.path().join("animation")),
        vec!["0000.png", "0002.png", "0004.png"]
    );
}

#[test]
fn nothing_is_animated_when_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let network = common::tiny_network(PoolMethod::Avg);

    let config = StyleConfig {
        iterations: 1,
        ..config(dir.path())
    };
    assert!(config.animation.is_none());

    style_image(&config, &network, None).unwrap();

    // Only the inputs and the single styled image exist afterwards
    assert_eq!(
        common::file_names(dir.path()),
        vec!["out", "style.png", "subject.png"]
    );
    assert_eq!(
        common::file_names(&dir.path().join("out")),
        vec!["styled.png"]
    );
}

#[test]
fn seeded_runs_are_identical() {
    let dir = tempfile::tempdir().unwrap();
    let network = common::tiny_network(PoolMethod::Max);

    let first = StyleConfig {
        init_noise: 0.6,
        random_seed: Some(42),
        output: dir.path().join("first.png"),
        ..config(dir.path())
    };
    let second = StyleConfig {
        output: dir.path().join("second.png"),
        ..first.clone()
    };

    style_image(&first, &network, None).unwrap();
    style_image(&second, &network, None).unwrap();

    let first = image::open(&first.output).unwrap().to_rgb8();
    let second = image::open(&second.output).unwrap().to_rgb8();
    assert_eq!(first.into_raw(), second.into_raw());
}

#[test]
fn optimization_lowers_the_content_cost() {
    let dir = tempfile::tempdir().unwrap();
    let network = common::tiny_network(PoolMethod::Avg);
    let config = StyleConfig {
        iterations: 30,
        learn_rate: 0.5,
        smoothness: 0.0,
        style_weights: Vec::new(),
        init_noise: 1.0,
        random_seed: Some(3),
        ..config(dir.path())
    };

    let costs = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorder = costs.clone();

    let progress = move |update: neural_style::ProgressUpdate<'_>| {
        recorder.lock().unwrap().push(update.cost);
    };

    config
        .session_builder()
        .build(&network)
        .unwrap()
        .run(Some(Box::new(progress)))
        .unwrap();

    let costs = costs.lock().unwrap();
    assert_eq!(costs.len(), 30);
    assert!(costs.iter().all(|c| c.is_finite()));
    assert!(costs[29] < costs[0], "{:?}", costs);
}

#[test]
fn rejects_bad_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let network = common::tiny_network(PoolMethod::Avg);
    let config = config(dir.path());

    let gif = StyleConfig {
        output: dir.path().join("out.gif"),
        ..config.clone()
    };
    assert!(matches!(
        style_image(&gif, &network, None),
        Err(Error::UnsupportedOutputFormat(_))
    ));

    // The default layers are deeper than the tiny network
    let deep = StyleConfig {
        subject_weights: neural_style::weights::default_subject_weights(),
        ..config.clone()
    };
    assert!(matches!(
        style_image(&deep, &network, None),
        Err(Error::LayerOutOfRange { index: 9, slots: 3 })
    ));

    let noisy = StyleConfig {
        init_noise: 2.0,
        ..config.clone()
    };
    assert!(matches!(
        style_image(&noisy, &network, None),
        Err(Error::InvalidRange(_))
    ));

    let missing = StyleConfig {
        style: dir.path().join("missing.png"),
        ..config
    };
    assert!(matches!(
        style_image(&missing, &network, None),
        Err(Error::Image(_))
    ));

    // Nothing was written for any of the failed runs
    assert!(!dir.path().join("out").exists());
}
