//! Conversions between the viewable `height x width x channel` layout of an
//! image and the `batch x channel x height x width` layout consumed by the
//! feature network.

use crate::{errors::ShapeMismatch, Error};
use ndarray::{Array3, Array4, Axis};
use std::path::Path;

/// Converts an `H x W x C` image into a `1 x C x H x W` network tensor
pub fn to_network_layout(img: &Array3<f32>) -> Array4<f32> {
    img.view()
        .permuted_axes([2, 0, 1])
        .insert_axis(Axis(0))
        .as_standard_layout()
        .into_owned()
}

/// Converts a `1 x C x H x W` network tensor back into an `H x W x C` image
pub fn to_view_layout(tensor: &Array4<f32>) -> Result<Array3<f32>, Error> {
    let (batch, channels, height, width) = tensor.dim();
    if batch != 1 {
        return Err(Error::ShapeMismatch(ShapeMismatch {
            name: "network tensor",
            expected: vec![1, channels, height, width],
            actual: tensor.shape().to_vec(),
        }));
    }

    Ok(tensor
        .index_axis(Axis(0), 0)
        .permuted_axes([1, 2, 0])
        .as_standard_layout()
        .into_owned())
}

/// Converts an 8-bit RGB image into an `H x W x 3` float tensor
pub fn image_to_tensor(img: &image::RgbImage) -> Array3<f32> {
    let (width, height) = img.dimensions();
    Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
        f32::from(img.get_pixel(x as u32, y as u32)[c])
    })
}

/// Converts an `H x W x 3` float tensor into an 8-bit RGB image, values are
/// clipped to `[0, 255]`
pub fn tensor_to_image(tensor: &Array3<f32>) -> image::RgbImage {
    let (height, width, _) = tensor.dim();
    image::RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        image::Rgb([
            to_u8(tensor[[y, x, 0]]),
            to_u8(tensor[[y, x, 1]]),
            to_u8(tensor[[y, x, 2]]),
        ])
    })
}

#[inline]
fn to_u8(v: f32) -> u8 {
    // NaN also ends up as 0
    v.max(0.0).min(255.0) as u8
}

/// Saves an `H x W x 3` tensor as an image, the format is determined by the
/// path's extension
pub fn save_tensor<P: AsRef<Path>>(path: P, tensor: &Array3<f32>) -> Result<(), Error> {
    let path = path.as_ref();
    if let Some(parent_path) = path.parent() {
        if !parent_path.as_os_str().is_empty() {
            std::fs::create_dir_all(parent_path)?;
        }
    }

    tensor_to_image(tensor).save(path)?;
    Ok(())
}
