use crate::{layout::image_to_tensor, Error};
use ndarray::{Array3, Axis};
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_pcg::Pcg32;
use std::path::Path;

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// Loads an image as an `H x W x 3` float tensor with the pixel mean
/// subtracted from every pixel
pub(crate) fn load_centered(
    src: ImageSource<'_>,
    pixel_mean: &[f32; 3],
) -> Result<Array3<f32>, Error> {
    let img = load_dynamic_image(src)?.to_rgb8();
    let mut tensor = image_to_tensor(&img);
    subtract_mean(&mut tensor, pixel_mean);
    Ok(tensor)
}

/// Subtracts the per-channel mean from every pixel of an `H x W x 3` tensor
pub fn subtract_mean(img: &mut Array3<f32>, pixel_mean: &[f32; 3]) {
    for mut pixel in img.lanes_mut(Axis(2)) {
        for (v, mean) in pixel.iter_mut().zip(pixel_mean.iter()) {
            *v -= mean;
        }
    }
}

/// Adds the per-channel mean back to every pixel of an `H x W x 3` tensor
pub fn add_mean(img: &mut Array3<f32>, pixel_mean: &[f32; 3]) {
    for mut pixel in img.lanes_mut(Axis(2)) {
        for (v, mean) in pixel.iter_mut().zip(pixel_mean.iter()) {
            *v += mean;
        }
    }
}

/// The population standard deviation of every value in the tensor
pub fn std_dev(img: &Array3<f32>) -> f32 {
    if img.is_empty() {
        return 0.0;
    }

    let n = img.len() as f64;
    let mean = img.iter().map(|v| f64::from(*v)).sum::<f64>() / n;
    let var = img
        .iter()
        .map(|v| {
            let d = f64::from(*v) - mean;
            d * d
        })
        .sum::<f64>()
        / n;

    var.sqrt() as f32
}

/// Creates the random generator used for the initial noise, seeded
/// deterministically if a seed is provided
pub(crate) fn noise_rng(seed: Option<u64>) -> Pcg32 {
    match seed {
        Some(seed) => Pcg32::seed_from_u64(seed),
        None => Pcg32::from_entropy(),
    }
}

/// Blends Gaussian noise into the initial image.
///
/// The noise has a standard deviation of 10% of the image's own standard
/// deviation, and is blended as `img * (1 - weight) + noise * weight`, so a
/// weight of 0 leaves the image untouched and a weight of 1 replaces it
/// with noise entirely.
pub fn blend_noise<R: Rng>(mut img: Array3<f32>, weight: f32, rng: &mut R) -> Array3<f32> {
    if weight == 0.0 {
        return img;
    }

    let scale = std_dev(&img) * 0.1;
    for v in img.iter_mut() {
        let sample: f32 = rng.sample(StandardNormal);
        *v = *v * (1.0 - weight) + sample * scale * weight;
    }

    img
}

/// The inputs to the loss network, all in view layout with the pixel mean
/// already subtracted
pub struct PreparedImages {
    pub subject: Array3<f32>,
    pub style: Array3<f32>,
    pub init: Array3<f32>,
}

/// Everything needed to load and prepare the images for a run
pub struct PrepareOptions<'a> {
    pub subject: ImageSource<'a>,
    pub style: ImageSource<'a>,
    /// The image to start from, defaults to the subject
    pub init: Option<ImageSource<'a>>,
    /// Range `[0, 1]`, validated before preparing
    pub noise_weight: f32,
    pub pixel_mean: [f32; 3],
    pub seed: Option<u64>,
}

/// Loads the subject, style, and initial images and applies noise to the
/// initial image
pub fn prepare(opts: PrepareOptions<'_>) -> Result<PreparedImages, Error> {
    let style = load_centered(opts.style, &opts.pixel_mean)?;
    let subject = load_centered(opts.subject, &opts.pixel_mean)?;

    let init = match opts.init {
        Some(init) => load_centered(init, &opts.pixel_mean)?,
        None => subject.clone(),
    };

    let mut rng = noise_rng(opts.seed);
    let init = blend_noise(init, opts.noise_weight, &mut rng);

    Ok(PreparedImages {
        subject,
        style,
        init,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_relative_eq;

    const MEAN: [f32; 3] = [123.68, 116.779, 103.939];

    fn gradient_image(w: u32, h: u32) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(image::RgbImage::from_fn(w, h, |x, y| {
            image::Rgb([(x * 20) as u8, (y * 30) as u8, ((x + y) * 10) as u8])
        }))
    }

    fn opts<'a>(noise_weight: f32, seed: Option<u64>) -> PrepareOptions<'a> {
        PrepareOptions {
            subject: gradient_image(8, 6).into(),
            style: gradient_image(5, 5).into(),
            init: None,
            noise_weight,
            pixel_mean: MEAN,
            seed,
        }
    }

    #[test]
    fn no_noise_keeps_subject() {
        let prepared = prepare(opts(0.0, None)).unwrap();

        assert_eq!(prepared.subject.dim(), (6, 8, 3));
        assert_eq!(prepared.style.dim(), (5, 5, 3));
        assert_eq!(prepared.init, prepared.subject);
        assert_relative_eq!(prepared.subject[[2, 3, 0]], 60.0 - MEAN[0]);
        assert_relative_eq!(prepared.subject[[2, 3, 2]], 50.0 - MEAN[2]);
    }

    #[test]
    fn explicit_init_is_used() {
        let mut o = opts(0.0, None);
        o.init = Some(gradient_image(8, 6).grayscale().into());
        let prepared = prepare(o).unwrap();

        assert_ne!(prepared.init, prepared.subject);
        assert_eq!(prepared.init.dim(), prepared.subject.dim());
    }

    #[test]
    fn full_noise_is_scaled_noise() {
        let a = prepare(opts(1.0, Some(7))).unwrap();

        // An image with the same spread but different values ends up with
        // identical noise
        let mut rng = noise_rng(Some(7));
        let negated = a.subject.mapv(|v| -v);
        let b = blend_noise(negated, 1.0, &mut rng);
        assert_eq!(a.init, b);

        let expected = std_dev(&a.subject) * 0.1;
        assert_relative_eq!(std_dev(&a.init), expected, max_relative = 0.25);
    }

    #[test]
    fn seeds_are_deterministic() {
        let a = prepare(opts(0.5, Some(3))).unwrap();
        let b = prepare(opts(0.5, Some(3))).unwrap();
        let c = prepare(opts(0.5, Some(4))).unwrap();
        let d = prepare(opts(0.5, None)).unwrap();

        assert_eq!(a.init, b.init);
        assert_ne!(a.init, c.init);
        assert_ne!(a.init, d.init);
    }

    #[test]
    fn mean_round_trips() {
        let mut t = Array3::from_elem((2, 2, 3), 100.0f32);
        subtract_mean(&mut t, &MEAN);
        assert_relative_eq!(t[[1, 1, 1]], 100.0 - MEAN[1]);
        add_mean(&mut t, &MEAN);
        assert_relative_eq!(t[[1, 1, 1]], 100.0, epsilon = 1e-4);
    }

    #[test]
    fn unreadable_image() {
        let mut o = opts(0.0, None);
        o.style = ImageSource::Path(Path::new("does/not/exist.png"));
        assert!(matches!(prepare(o), Err(Error::Image(_))));
    }
}
