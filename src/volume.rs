use ndarray::Array3;

/// Patient-space placement of the voxel grid, in DICOM LPS coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    /// Position of the first voxel of the first slice.
    pub origin: [f64; 3],
    /// Direction cosine along a row (increasing column index).
    pub row_direction: [f64; 3],
    /// Direction cosine along a column (increasing row index).
    pub column_direction: [f64; 3],
    /// Direction from one slice to the next.
    pub slice_direction: [f64; 3],
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            origin: [0.0; 3],
            row_direction: [1.0, 0.0, 0.0],
            column_direction: [0.0, 1.0, 0.0],
            slice_direction: [0.0, 0.0, 1.0],
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Volume {
    /// Voxel values indexed as (slice, row, column).
    pub data: Array3<f32>,
    /// Voxel size as (column spacing, row spacing, slice spacing) in mm.
    pub spacing: (f32, f32, f32),
    pub geometry: Geometry,
}

impl Volume {
    pub fn new(data: Array3<f32>, spacing: (f32, f32, f32), geometry: Geometry) -> Self {
        Self {
            data,
            spacing,
            geometry,
        }
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn slice_count(&self) -> usize {
        self.data.dim().0
    }

    /// Voxel-to-patient affine in NIfTI RAS convention, as three rows of
    /// `[x, y, z, translation]`.
    pub fn ras_affine(&self) -> [[f32; 4]; 3] {
        let Geometry {
            origin,
            row_direction,
            column_direction,
            slice_direction,
        } = self.geometry;
        let (dx, dy, dz) = self.spacing;
        // LPS -> RAS flips the first two patient axes.
        let flip = [-1.0, -1.0, 1.0];

        let mut affine = [[0.0f32; 4]; 3];
        for (axis, row) in affine.iter_mut().enumerate() {
            row[0] = (flip[axis] * row_direction[axis] * f64::from(dx)) as f32;
            row[1] = (flip[axis] * column_direction[axis] * f64::from(dy)) as f32;
            row[2] = (flip[axis] * slice_direction[axis] * f64::from(dz)) as f32;
            row[3] = (flip[axis] * origin[axis]) as f32;
        }
        affine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_geometry_flips_in_plane_axes() {
        let volume = Volume::new(
            Array3::zeros((4, 2, 3)),
            (0.5, 0.75, 2.0),
            Geometry {
                origin: [10.0, 20.0, 30.0],
                ..Geometry::default()
            },
        );

        let affine = volume.ras_affine();
        assert_eq!(affine[0], [-0.5, 0.0, 0.0, -10.0]);
        assert_eq!(affine[1], [0.0, -0.75, 0.0, -20.0]);
        assert_eq!(affine[2], [0.0, 0.0, 2.0, 30.0]);
        assert_eq!(volume.slice_count(), 4);
    }
}
