//! Minimal NIfTI-1 single-file (`.nii.gz`) support for float volumes.
//!
//! The writer emits a 348 byte header, an empty extension block and the
//! voxel data in native byte order, gzip compressed. Readers detect the byte
//! order from `sizeof_hdr`, so native order is valid NIfTI.

use crate::volume::Volume;

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use ndarray::Array3;
use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
};
use tempfile::NamedTempFile;

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;
const DT_FLOAT32: i16 = 16;
const NIFTI_UNITS_MM: u8 = 2;
const NIFTI_XFORM_SCANNER_ANAT: i16 = 1;

/// Header fields this crate reads back.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    /// (columns, rows, slices)
    pub dim: [usize; 3],
    pub pixdim: [f32; 3],
    pub datatype: i16,
    pub srow: [[f32; 4]; 3],
}

impl NiftiHeader {
    pub fn slice_count(&self) -> usize {
        self.dim[2]
    }

    fn voxel_count(&self) -> usize {
        self.dim.iter().product()
    }
}

struct HeaderBuf([u8; VOX_OFFSET]);

impl HeaderBuf {
    fn put_i16(&mut self, offset: usize, value: i16) {
        self.0[offset..offset + 2].copy_from_slice(&value.to_ne_bytes());
    }

    fn put_i32(&mut self, offset: usize, value: i32) {
        self.0[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn put_f32(&mut self, offset: usize, value: f32) {
        self.0[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn get_i16(&self, offset: usize, swap: bool) -> i16 {
        let value = i16::from_ne_bytes([self.0[offset], self.0[offset + 1]]);
        if swap { value.swap_bytes() } else { value }
    }

    fn get_f32(&self, offset: usize, swap: bool) -> f32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.0[offset..offset + 4]);
        let bits = u32::from_ne_bytes(bytes);
        f32::from_bits(if swap { bits.swap_bytes() } else { bits })
    }
}

fn encode_header(volume: &Volume) -> io::Result<HeaderBuf> {
    let (depth, height, width) = volume.dim();
    let to_dim =
        |d: usize| i16::try_from(d).map_err(|_| invalid("volume dimension exceeds NIfTI-1 limit"));
    let (nx, ny, nz) = (to_dim(width)?, to_dim(height)?, to_dim(depth)?);

    let affine = volume.ras_affine();
    let (dx, dy, dz) = volume.spacing;
    let (quatern, qfac) = quaternion(&affine, [dx, dy, dz]);

    let mut header = HeaderBuf([0u8; VOX_OFFSET]);
    header.put_i32(0, HEADER_SIZE as i32);
    header.0[38] = b'r';
    for (i, value) in [3, nx, ny, nz, 1, 1, 1, 1].into_iter().enumerate() {
        header.put_i16(40 + 2 * i, value);
    }
    header.put_i16(70, DT_FLOAT32);
    header.put_i16(72, 32);
    for (i, value) in [qfac, dx, dy, dz, 1.0, 1.0, 1.0, 1.0].into_iter().enumerate() {
        header.put_f32(76 + 4 * i, value);
    }
    header.put_f32(108, VOX_OFFSET as f32);
    header.put_f32(112, 1.0);
    header.0[123] = NIFTI_UNITS_MM;

    let description = b"dicom-segmentation";
    header.0[148..148 + description.len()].copy_from_slice(description);

    header.put_i16(252, NIFTI_XFORM_SCANNER_ANAT);
    header.put_i16(254, NIFTI_XFORM_SCANNER_ANAT);
    for (i, value) in quatern.into_iter().enumerate() {
        header.put_f32(256 + 4 * i, value);
    }
    header.put_f32(268, affine[0][3]);
    header.put_f32(272, affine[1][3]);
    header.put_f32(276, affine[2][3]);
    for (row, values) in affine.iter().enumerate() {
        for (col, value) in values.iter().enumerate() {
            header.put_f32(280 + 16 * row + 4 * col, *value);
        }
    }
    header.0[344..348].copy_from_slice(b"n+1\0");
    Ok(header)
}

/// Quaternion (b, c, d) and qfac of the rotation part of `affine`.
fn quaternion(affine: &[[f32; 4]; 3], spacing: [f32; 3]) -> ([f32; 3], f32) {
    let mut r = [[0.0f64; 3]; 3];
    for (col, size) in spacing.iter().enumerate() {
        let size = if *size > 0.0 { f64::from(*size) } else { 1.0 };
        for row in 0..3 {
            r[row][col] = f64::from(affine[row][col]) / size;
        }
    }

    let det = r[0][0] * (r[1][1] * r[2][2] - r[1][2] * r[2][1])
        - r[0][1] * (r[1][0] * r[2][2] - r[1][2] * r[2][0])
        + r[0][2] * (r[1][0] * r[2][1] - r[1][1] * r[2][0]);
    let qfac = if det < 0.0 {
        for row in r.iter_mut() {
            row[2] = -row[2];
        }
        -1.0
    } else {
        1.0
    };

    let trace = r[0][0] + r[1][1] + r[2][2] + 1.0;
    let (a, b, c, d);
    if trace > 0.5 {
        a = 0.5 * trace.sqrt();
        b = 0.25 * (r[2][1] - r[1][2]) / a;
        c = 0.25 * (r[0][2] - r[2][0]) / a;
        d = 0.25 * (r[1][0] - r[0][1]) / a;
    } else {
        let xd = 1.0 + r[0][0] - (r[1][1] + r[2][2]);
        let yd = 1.0 + r[1][1] - (r[0][0] + r[2][2]);
        let zd = 1.0 + r[2][2] - (r[0][0] + r[1][1]);
        if xd > 1.0 {
            b = 0.5 * xd.sqrt();
            c = 0.25 * (r[0][1] + r[1][0]) / b;
            d = 0.25 * (r[0][2] + r[2][0]) / b;
            a = 0.25 * (r[2][1] - r[1][2]) / b;
        } else if yd > 1.0 {
            c = 0.5 * yd.sqrt();
            b = 0.25 * (r[0][1] + r[1][0]) / c;
            d = 0.25 * (r[1][2] + r[2][1]) / c;
            a = 0.25 * (r[0][2] - r[2][0]) / c;
        } else {
            d = 0.5 * zd.sqrt();
            b = 0.25 * (r[0][2] + r[2][0]) / d;
            c = 0.25 * (r[1][2] + r[2][1]) / d;
            a = 0.25 * (r[1][0] - r[0][1]) / d;
        }
    }

    let sign = if a < 0.0 { -1.0 } else { 1.0 };
    ([b * sign, c * sign, d * sign].map(|v| v as f32), qfac)
}

fn invalid(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Write `volume` to `path` as gzip compressed NIfTI-1.
///
/// The data goes to a temporary file next to `path` which then replaces
/// `path`, so a failed write leaves any previous file untouched.
pub fn write_volume(volume: &Volume, path: &Path) -> io::Result<()> {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let header = encode_header(volume)?;
    let data = volume.data.as_standard_layout();
    let voxels = data
        .as_slice()
        .ok_or_else(|| invalid("volume data is not contiguous"))?;

    let mut temp = NamedTempFile::new_in(directory)?;
    {
        let mut encoder = GzEncoder::new(BufWriter::new(temp.as_file_mut()), Compression::default());
        encoder.write_all(&header.0)?;
        encoder.write_all(bytemuck::cast_slice(voxels))?;
        encoder.finish()?.flush()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn read_header_from(reader: &mut impl Read) -> io::Result<(NiftiHeader, bool)> {
    let mut header = HeaderBuf([0u8; VOX_OFFSET]);
    reader.read_exact(&mut header.0[..HEADER_SIZE])?;

    let size = i32::from_ne_bytes([header.0[0], header.0[1], header.0[2], header.0[3]]);
    let swap = match size {
        s if s == HEADER_SIZE as i32 => false,
        s if s.swap_bytes() == HEADER_SIZE as i32 => true,
        _ => return Err(invalid("not a NIfTI-1 file")),
    };
    if &header.0[344..347] != b"n+1" {
        return Err(invalid("not a single-file NIfTI-1 image"));
    }

    let mut dim = [0usize; 3];
    for (i, d) in dim.iter_mut().enumerate() {
        *d = usize::try_from(header.get_i16(42 + 2 * i, swap).max(1)).unwrap_or(1);
    }
    let mut srow = [[0.0f32; 4]; 3];
    for (row, values) in srow.iter_mut().enumerate() {
        for (col, value) in values.iter_mut().enumerate() {
            *value = header.get_f32(280 + 16 * row + 4 * col, swap);
        }
    }

    Ok((
        NiftiHeader {
            dim,
            pixdim: [
                header.get_f32(80, swap),
                header.get_f32(84, swap),
                header.get_f32(88, swap),
            ],
            datatype: header.get_i16(70, swap),
            srow,
        },
        swap,
    ))
}

fn open_gz(path: &Path) -> io::Result<GzDecoder<BufReader<File>>> {
    Ok(GzDecoder::new(BufReader::new(File::open(path)?)))
}

/// Read only the header of a `.nii.gz` file.
pub fn read_header(path: &Path) -> io::Result<NiftiHeader> {
    read_header_from(&mut open_gz(path)?).map(|(header, _)| header)
}

/// Read a float32 `.nii.gz` file back as (slice, row, column) data.
pub fn read_volume(path: &Path) -> io::Result<(NiftiHeader, Array3<f32>)> {
    let mut reader = open_gz(path)?;
    let (header, swap) = read_header_from(&mut reader)?;
    if header.datatype != DT_FLOAT32 {
        return Err(invalid("only float32 NIfTI data is supported"));
    }

    let mut extension = [0u8; VOX_OFFSET - HEADER_SIZE];
    reader.read_exact(&mut extension)?;

    let mut bytes = vec![0u8; header.voxel_count() * 4];
    reader.read_exact(&mut bytes)?;
    let voxels: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| {
            let bits = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            f32::from_bits(if swap { bits.swap_bytes() } else { bits })
        })
        .collect();

    let [nx, ny, nz] = header.dim;
    let data = Array3::from_shape_vec((nz, ny, nx), voxels).map_err(|e| invalid(&e.to_string()))?;
    Ok((header, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::Geometry;

    fn ramp_volume() -> Volume {
        let data = Array3::from_shape_fn((3, 4, 5), |(z, y, x)| (z * 100 + y * 10 + x) as f32);
        Volume::new(data, (0.7, 0.7, 2.5), Geometry::default())
    }

    #[test]
    fn written_volume_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct.nii.gz");
        let volume = ramp_volume();

        write_volume(&volume, &path).unwrap();
        let (header, data) = read_volume(&path).unwrap();

        assert_eq!(header.dim, [5, 4, 3]);
        assert_eq!(header.pixdim, [0.7, 0.7, 2.5]);
        assert_eq!(header.srow, volume.ras_affine());
        assert_eq!(data, volume.data);
    }

    #[test]
    fn overwrite_leaves_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ct.nii.gz");

        write_volume(&ramp_volume(), &path).unwrap();
        write_volume(&ramp_volume(), &path).unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn identity_rotation_has_zero_quaternion() {
        let affine = [
            [2.0, 0.0, 0.0, 0.0],
            [0.0, 2.0, 0.0, 0.0],
            [0.0, 0.0, 3.0, 0.0],
        ];
        let (quatern, qfac) = quaternion(&affine, [2.0, 2.0, 3.0]);
        assert_eq!(quatern, [0.0, 0.0, 0.0]);
        assert_eq!(qfac, 1.0);
    }

    #[test]
    fn rejects_non_nifti_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.nii.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::fast());
        encoder.write_all(&[0u8; HEADER_SIZE]).unwrap();
        encoder.finish().unwrap();

        assert_eq!(read_header(&path).unwrap_err().kind(), io::ErrorKind::InvalidData);
    }
}
