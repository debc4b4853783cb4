use std::fs;
use std::path::Path;

use crate::device::DeviceBuffer;
use crate::error::{NetErr, Result};

/// Stages a device buffer to the host and writes it as raw f32 bytes.
pub(crate) fn write_floats(path: &Path, buf: &DeviceBuffer) -> Result<()> {
    let mut host = vec![0.0f32; buf.len()];
    buf.copy_to_host(&mut host);
    fs::write(path, bytemuck::cast_slice::<f32, u8>(&host))?;
    Ok(())
}

/// Reads a raw f32 file and stages it into a device buffer of the exact
/// matching length.
pub(crate) fn read_floats(path: &Path, buf: &mut DeviceBuffer) -> Result<()> {
    let bytes = fs::read(path)?;
    if bytes.len() != buf.len() * size_of::<f32>() {
        return Err(NetErr::ShapeMismatch {
            what: "parameter file",
            got: bytes.len(),
            expected: buf.len() * size_of::<f32>(),
        });
    }

    let host: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
    buf.copy_from_host(&host);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("nnt_storage_{}_{name}", std::process::id()))
    }

    #[test]
    fn roundtrip_is_bit_exact() {
        let path = temp_file("roundtrip");
        let values = [1.5f32, -0.0, f32::MIN_POSITIVE, 1.0e30, -7.25];

        let mut src = DeviceBuffer::alloc(5);
        src.copy_from_host(&values);
        write_floats(&path, &src).unwrap();

        let mut dst = DeviceBuffer::alloc(5);
        read_floats(&path, &mut dst).unwrap();
        fs::remove_file(&path).unwrap();

        for (a, b) in values.iter().zip(dst.as_slice()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn read_rejects_wrong_length() {
        let path = temp_file("short");
        let mut src = DeviceBuffer::alloc(2);
        src.copy_from_host(&[1.0, 2.0]);
        write_floats(&path, &src).unwrap();

        let mut dst = DeviceBuffer::alloc(3);
        let err = read_floats(&path, &mut dst);
        fs::remove_file(&path).unwrap();

        assert!(matches!(
            err,
            Err(NetErr::ShapeMismatch {
                what: "parameter file",
                ..
            })
        ));
    }

    #[test]
    fn read_missing_file_is_io_error() {
        let mut dst = DeviceBuffer::alloc(1);
        assert!(matches!(
            read_floats(Path::new("/nonexistent/params/0"), &mut dst),
            Err(NetErr::Io(_))
        ));
    }
}
