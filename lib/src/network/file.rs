use super::{Conv2d, Layer, NetworkLoader, NetworkSpec, PoolMethod};
use crate::Error;
use ndarray::{Array1, Array4};
use std::{
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

const NETWORK_MAGIC: u32 = 0x4e53_0001;

const TAG_CONV: u32 = 0;
const TAG_POOL: u32 = 1;

// Anything bigger than this is surely a corrupt file rather than a network
const MAX_LAYERS: u32 = 4096;
const MAX_CONV_ELEMENTS: usize = 1 << 28;

/// Reads and writes networks in a small little-endian binary format.
///
/// ```text
/// u32 magic, u32 layer count
/// per layer: u32 tag
///   conv (0): u32 out, u32 in, u32 kernel height, u32 kernel width,
///             f32 weights[out * in * kh * kw], f32 biases[out]
///   pool (1): nothing, the method is chosen when loading
/// f32 pixel mean[3]
/// ```
pub struct NetworkFile;

fn truncated(err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        Error::InvalidNetwork("unexpected end of file".to_owned())
    } else {
        Error::Io(err)
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32s<R: Read>(r: &mut R, count: usize) -> Result<Vec<f32>, Error> {
    let mut bytes = vec![0u8; count * 4];
    r.read_exact(&mut bytes).map_err(truncated)?;

    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<usize> {
    w.write_all(&v.to_le_bytes())?;
    Ok(4)
}

fn write_f32s<'a, W: Write, I: IntoIterator<Item = &'a f32>>(
    w: &mut W,
    vals: I,
) -> io::Result<usize> {
    let mut written = 0;
    for v in vals {
        w.write_all(&v.to_le_bytes())?;
        written += 4;
    }
    Ok(written)
}

impl NetworkFile {
    /// Reads a network, using `pool` for every pooling layer
    pub fn read<R: Read>(r: &mut R, pool: PoolMethod) -> Result<NetworkSpec, Error> {
        let magic = read_u32(r)?;

        if magic >> 16 != NETWORK_MAGIC >> 16 {
            return Err(Error::InvalidNetwork("invalid magic".to_owned()));
        }

        if magic & 0x0000_ffff != NETWORK_MAGIC & 0x0000_ffff {
            return Err(Error::InvalidNetwork(format!(
                "unsupported version {}",
                magic & 0x0000_ffff
            )));
        }

        let layer_count = read_u32(r)?;
        if layer_count > MAX_LAYERS {
            return Err(Error::InvalidNetwork(format!(
                "{} layers is more than the maximum of {}",
                layer_count, MAX_LAYERS
            )));
        }

        let mut layers = Vec::with_capacity(layer_count as usize);
        for i in 0..layer_count {
            match read_u32(r)? {
                TAG_CONV => {
                    let mut dims = [0usize; 4];
                    for d in &mut dims {
                        *d = read_u32(r)? as usize;
                    }

                    let count = dims
                        .iter()
                        .try_fold(1usize, |acc, d| acc.checked_mul(*d))
                        .filter(|c| *c <= MAX_CONV_ELEMENTS)
                        .ok_or_else(|| {
                            Error::InvalidNetwork(format!("layer {} is too large", i))
                        })?;

                    let weights = read_f32s(r, count)?;
                    let bias = read_f32s(r, dims[0])?;

                    let weights =
                        Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), weights)
                            .map_err(|e| Error::InvalidNetwork(e.to_string()))?;

                    layers.push(Layer::Conv(Conv2d::new(weights, Array1::from(bias))?));
                }
                TAG_POOL => layers.push(Layer::Pool(pool)),
                tag => {
                    return Err(Error::InvalidNetwork(format!(
                        "layer {} has unknown type {}",
                        i, tag
                    )))
                }
            }
        }

        let mean = read_f32s(r, 3)?;
        NetworkSpec::new(layers, [mean[0], mean[1], mean[2]])
    }

    /// Writes the network, returning the number of bytes written
    pub fn write<W: Write>(w: &mut W, spec: &NetworkSpec) -> io::Result<usize> {
        let mut written = write_u32(w, NETWORK_MAGIC)?;
        written += write_u32(w, spec.layers().len() as u32)?;

        for layer in spec.layers() {
            match layer {
                Layer::Conv(conv) => {
                    written += write_u32(w, TAG_CONV)?;
                    for d in conv.weights().shape() {
                        written += write_u32(w, *d as u32)?;
                    }
                    written += write_f32s(w, conv.weights().iter())?;
                    written += write_f32s(w, conv.bias().iter())?;
                }
                Layer::Pool(_) => written += write_u32(w, TAG_POOL)?,
            }
        }

        written += write_f32s(w, spec.pixel_mean().iter())?;
        Ok(written)
    }

    /// Saves the network to disk
    pub fn save<P: AsRef<Path>>(path: P, spec: &NetworkSpec) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut output = io::BufWriter::new(std::fs::File::create(path)?);
        Self::write(&mut output, spec)?;
        output.flush()?;
        Ok(())
    }
}

/// Loads a network from a file on disk
#[derive(Clone, Debug)]
pub struct FileLoader {
    path: PathBuf,
}

impl FileLoader {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl NetworkLoader for FileLoader {
    fn load(&self, pool: PoolMethod) -> Result<NetworkSpec, Error> {
        let file = std::fs::File::open(&self.path).map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("failed to open network '{}': {}", self.path.display(), err),
            )
        })?;
        let spec = NetworkFile::read(&mut io::BufReader::new(file), pool)?;

        log::info!(
            "loaded network '{}' with {} layers ({} weighted)",
            self.path.display(),
            spec.layers().len(),
            spec.weight_slots()
        );

        Ok(spec)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec() -> NetworkSpec {
        let w1 = Array4::from_shape_fn((2, 3, 3, 3), |(o, i, y, x)| (o + i + y + x) as f32 * 0.5);
        let w2 = Array4::from_shape_fn((4, 2, 1, 1), |(o, i, _, _)| o as f32 - i as f32);

        NetworkSpec::new(
            vec![
                Layer::Conv(Conv2d::new(w1, Array1::from(vec![1.0, -1.0])).unwrap()),
                Layer::Pool(PoolMethod::Max),
                Layer::Conv(Conv2d::new(w2, Array1::zeros(4)).unwrap()),
            ],
            [123.68, 116.779, 103.939],
        )
        .unwrap()
    }

    #[test]
    fn network_serde() {
        let input = spec();

        let mut buffer = Vec::new();
        let written = NetworkFile::write(&mut buffer, &input).unwrap();
        assert_eq!(written, buffer.len());

        let mut cursor = io::Cursor::new(&buffer);
        let read = NetworkFile::read(&mut cursor, PoolMethod::Avg).unwrap();

        assert_eq!(read.weight_slots(), 2);
        assert_eq!(read.pixel_mean(), input.pixel_mean());
        // The pooling method is decided when loading
        assert_eq!(read.pool_method(), Some(PoolMethod::Avg));

        match (&read.layers()[2], &input.layers()[2]) {
            (Layer::Conv(a), Layer::Conv(b)) => {
                assert_eq!(a.weights(), b.weights());
                assert_eq!(a.bias(), b.bias());
            }
            _ => panic!("expected convolutions"),
        }
    }

    #[test]
    fn rejects_garbage() {
        let mut buffer = Vec::new();
        NetworkFile::write(&mut buffer, &spec()).unwrap();

        let mut bad_magic = buffer.clone();
        bad_magic[3] = 0x12;
        assert!(matches!(
            NetworkFile::read(&mut io::Cursor::new(&bad_magic), PoolMethod::Avg),
            Err(Error::InvalidNetwork(_))
        ));

        let mut bad_version = buffer.clone();
        bad_version[0] = 0x02;
        assert!(NetworkFile::read(&mut io::Cursor::new(&bad_version), PoolMethod::Avg).is_err());

        let truncated = &buffer[..buffer.len() - 5];
        assert!(matches!(
            NetworkFile::read(&mut io::Cursor::new(truncated), PoolMethod::Avg),
            Err(Error::InvalidNetwork(_))
        ));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nets").join("tiny.nsn");
        NetworkFile::save(&path, &spec()).unwrap();

        let loaded = FileLoader::new(&path).load(PoolMethod::Max).unwrap();
        assert_eq!(loaded.layers().len(), 3);

        match FileLoader::new(dir.path().join("missing.nsn")).load(PoolMethod::Max) {
            Err(Error::Io(err)) => {
                assert_eq!(err.kind(), io::ErrorKind::NotFound);
                assert!(err.to_string().contains("missing.nsn"), "{}", err);
            }
            _ => panic!("a missing network should be an io error"),
        }
    }
}
