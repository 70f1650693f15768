#![allow(dead_code)]

use neural_style::{
    image,
    network::{Conv2d, Layer, NetworkFile, NetworkSpec, PoolMethod},
    LayerWeight,
};
use ndarray::{Array1, Array4};
use std::path::{Path, PathBuf};

pub const MEAN: [f32; 3] = [123.68, 116.779, 103.939];

fn conv(inputs: usize, outputs: usize, seed: usize) -> Layer {
    let weights = Array4::from_shape_fn((outputs, inputs, 3, 3), |(o, i, y, x)| {
        ((o * 7 + i * 3 + y * 5 + x + seed) % 9) as f32 * 0.02 - 0.07
    });
    let bias = Array1::from_shape_fn(outputs, |o| 0.05 * o as f32);

    Layer::Conv(Conv2d::new(weights, bias).unwrap())
}

/// conv, pool, conv, conv: 3 weight slots
pub fn tiny_network(pool: PoolMethod) -> NetworkSpec {
    NetworkSpec::new(
        vec![
            conv(3, 4, 0),
            Layer::Pool(pool),
            conv(4, 4, 1),
            conv(4, 4, 2),
        ],
        MEAN,
    )
    .unwrap()
}

pub fn save_tiny_network(dir: &Path) -> PathBuf {
    let path = dir.join("tiny.nsn");
    NetworkFile::save(&path, &tiny_network(PoolMethod::Max)).unwrap();
    path
}

pub fn subject_weights() -> Vec<LayerWeight> {
    vec![LayerWeight::new(1, 1.0)]
}

pub fn style_weights() -> Vec<LayerWeight> {
    vec![LayerWeight::new(0, 1.0), LayerWeight::new(2, 1.0)]
}

pub fn gradient_image(w: u32, h: u32) -> image::RgbImage {
    image::RgbImage::from_fn(w, h, |x, y| {
        image::Rgb([
            (x * 255 / w.max(1)) as u8,
            (y * 255 / h.max(1)) as u8,
            ((x + y) * 37 % 256) as u8,
        ])
    })
}

pub fn checker_image(w: u32, h: u32) -> image::RgbImage {
    image::RgbImage::from_fn(w, h, |x, y| {
        if (x / 2 + y / 2) % 2 == 0 {
            image::Rgb([230, 40, 30])
        } else {
            image::Rgb([20, 30, 200])
        }
    })
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
