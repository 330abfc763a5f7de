//! The `PeriodicBox` type represents the simulation volume, and implements
//! the minimum image convention used by all neighbor searches.
use crate::{Error, Matrix3, Vector3D};

/// Raw parameters of a periodic box, as they are read from configuration
/// files. Use [`PeriodicBox::try_from`] to validate them.
#[derive(Debug, Clone, Copy, PartialEq)]
#[derive(serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BoxParameters {
    /// Length of the box along the x axis
    pub lx: f64,
    /// Length of the box along the y axis
    pub ly: f64,
    /// Length of the box along the z axis, ignored for 2D boxes
    #[serde(default)]
    pub lz: f64,
    /// Tilt factor of the second lattice vector along x
    #[serde(default)]
    pub xy: f64,
    /// Tilt factor of the third lattice vector along x
    #[serde(default)]
    pub xz: f64,
    /// Tilt factor of the third lattice vector along y
    #[serde(default)]
    pub yz: f64,
    /// Is this a two-dimensional box?
    #[serde(default)]
    pub is_2d: bool,
}

/// A `PeriodicBox` defines a periodic simulation volume, centered on the
/// origin.
///
/// The box is defined by three edge lengths `lx, ly, lz` and three tilt
/// factors `xy, xz, yz`, giving the lattice vectors
///
/// ```text
/// a1 = (lx,      0,       0)
/// a2 = (xy * ly, ly,      0)
/// a3 = (xz * lz, yz * lz, lz)
/// ```
///
/// For two-dimensional boxes, the z component of all vectors is ignored and
/// forced to zero, and the `lz`, `xz` and `yz` parameters are not used.
#[derive(Debug, Clone, Copy, PartialEq)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(try_from = "BoxParameters", into = "BoxParameters")]
pub struct PeriodicBox {
    parameters: BoxParameters,
    /// Box matrix, with the lattice vectors as columns
    matrix: Matrix3,
    /// Inverse of the box matrix, cached from matrix
    inverse: Matrix3,
}

impl TryFrom<BoxParameters> for PeriodicBox {
    type Error = Error;

    fn try_from(parameters: BoxParameters) -> Result<PeriodicBox, Error> {
        PeriodicBox::new(
            parameters.lx, parameters.ly, parameters.lz,
            parameters.xy, parameters.xz, parameters.yz,
            parameters.is_2d,
        )
    }
}

impl From<PeriodicBox> for BoxParameters {
    fn from(periodic_box: PeriodicBox) -> BoxParameters {
        periodic_box.parameters
    }
}

impl PeriodicBox {
    /// Create a new box with the given edge lengths and tilt factors.
    ///
    /// Edge lengths must be strictly positive and finite, and tilt factors
    /// must be finite. For 2D boxes `lz` is ignored, and `xz` and `yz` must
    /// be zero.
    pub fn new(lx: f64, ly: f64, lz: f64, xy: f64, xz: f64, yz: f64, is_2d: bool) -> Result<PeriodicBox, Error> {
        let check_length = |name: &str, value: f64| {
            if value > 0.0 && value.is_finite() {
                Ok(())
            } else {
                Err(Error::InvalidBox(format!(
                    "{} must be positive and finite, got {}", name, value
                )))
            }
        };

        check_length("lx", lx)?;
        check_length("ly", ly)?;
        if !is_2d {
            check_length("lz", lz)?;
        }

        for (name, value) in [("xy", xy), ("xz", xz), ("yz", yz)] {
            if !value.is_finite() {
                return Err(Error::InvalidBox(format!(
                    "tilt factor {} must be finite, got {}", name, value
                )));
            }
        }

        if is_2d && (xz != 0.0 || yz != 0.0) {
            return Err(Error::InvalidBox(
                "tilt factors xz and yz must be zero for 2D boxes".into()
            ));
        }

        // 2D boxes still use a full 3x3 matrix, with a unit length along z
        let matrix_lz = if is_2d { 1.0 } else { lz };
        let matrix = Matrix3::new([
            [lx,  xy * ly, xz * matrix_lz],
            [0.0, ly,      yz * matrix_lz],
            [0.0, 0.0,     matrix_lz],
        ]);

        return Ok(PeriodicBox {
            parameters: BoxParameters {
                lx, ly,
                lz: if is_2d { 0.0 } else { lz },
                xy, xz, yz, is_2d,
            },
            matrix: matrix,
            inverse: matrix.inverse(),
        });
    }

    /// Create a cubic box with side length `length`
    pub fn cube(length: f64) -> Result<PeriodicBox, Error> {
        PeriodicBox::new(length, length, length, 0.0, 0.0, 0.0, false)
    }

    /// Create a 2D square box with side length `length`
    pub fn square(length: f64) -> Result<PeriodicBox, Error> {
        PeriodicBox::new(length, length, 0.0, 0.0, 0.0, 0.0, true)
    }

    /// Create an orthorhombic box with side lengths `lx, ly, lz`
    pub fn orthorhombic(lx: f64, ly: f64, lz: f64) -> Result<PeriodicBox, Error> {
        PeriodicBox::new(lx, ly, lz, 0.0, 0.0, 0.0, false)
    }

    /// Get the edge lengths of this box. The last one is 0 for 2D boxes.
    pub fn lengths(&self) -> Vector3D {
        Vector3D::new(self.parameters.lx, self.parameters.ly, self.parameters.lz)
    }

    /// Get the tilt factors `(xy, xz, yz)` of this box
    pub fn tilts(&self) -> (f64, f64, f64) {
        (self.parameters.xy, self.parameters.xz, self.parameters.yz)
    }

    /// Is this a two-dimensional box?
    pub fn is_2d(&self) -> bool {
        self.parameters.is_2d
    }

    /// Does this box have any non-zero tilt factor?
    pub fn is_triclinic(&self) -> bool {
        self.parameters.xy != 0.0 || self.parameters.xz != 0.0 || self.parameters.yz != 0.0
    }

    /// Get the number of spatial dimensions of this box (2 or 3)
    pub fn dimensions(&self) -> usize {
        if self.is_2d() { 2 } else { 3 }
    }

    /// Get the volume of this box, or its area for 2D boxes
    pub fn volume(&self) -> f64 {
        if self.is_2d() {
            self.parameters.lx * self.parameters.ly
        } else {
            self.parameters.lx * self.parameters.ly * self.parameters.lz
        }
    }

    /// Get the lattice vector with the given index (0, 1 or 2). For 2D boxes,
    /// the third lattice vector is zero.
    pub fn lattice_vector(&self, index: usize) -> Vector3D {
        assert!(index < 3, "lattice vector index must be 0, 1 or 2");
        if self.is_2d() && index == 2 {
            return Vector3D::zero();
        }

        Vector3D::new(
            self.matrix[0][index],
            self.matrix[1][index],
            self.matrix[2][index],
        )
    }

    /// Get the box matrix, with the lattice vectors as columns
    pub fn matrix(&self) -> Matrix3 {
        self.matrix
    }

    /// Get the distances between opposite faces of this box. For 2D boxes,
    /// the last component is infinite.
    pub fn nearest_plane_distance(&self) -> Vector3D {
        let a1 = self.lattice_vector(0);
        let a2 = self.lattice_vector(1);

        if self.is_2d() {
            // distance from each lattice vector to the line of the other one
            let cross = f64::abs(a1[0] * a2[1] - a1[1] * a2[0]);
            return Vector3D::new(cross / a2.norm(), cross / a1.norm(), f64::INFINITY);
        }

        let a3 = self.lattice_vector(2);
        let volume = f64::abs(a1 * (a2 ^ a3));
        Vector3D::new(
            volume / (a2 ^ a3).norm(),
            volume / (a3 ^ a1).norm(),
            volume / (a1 ^ a2).norm(),
        )
    }

    /// Get an upper bound on the length of any vector returned by
    /// [`PeriodicBox::wrap`].
    pub fn max_image_distance(&self) -> f64 {
        let mut distance = self.lattice_vector(0).norm() + self.lattice_vector(1).norm();
        if !self.is_2d() {
            distance += self.lattice_vector(2).norm();
        }
        return 0.5 * distance;
    }
}

/// Geometric operations using periodic boundary conditions
impl PeriodicBox {
    /// Get the fractional coordinates of `position` in this box. Positions
    /// inside the box have all fractional coordinates in `[0, 1)`.
    pub fn make_fractional(&self, position: Vector3D) -> Vector3D {
        let mut fractional = self.inverse * self.project(position);
        fractional[0] += 0.5;
        fractional[1] += 0.5;
        fractional[2] += 0.5;
        return fractional;
    }

    /// Get the Cartesian position corresponding to the given `fractional`
    /// coordinates in this box.
    pub fn make_cartesian(&self, fractional: Vector3D) -> Vector3D {
        let centered = fractional - Vector3D::new(0.5, 0.5, 0.5);
        return self.project(self.matrix * centered);
    }

    /// Get the minimum image of `displacement`, i.e. the shortest vector
    /// consistent with the periodic boundary conditions. All fractional
    /// components of the result are in `[-1/2, 1/2)`.
    pub fn wrap(&self, displacement: Vector3D) -> Vector3D {
        let mut fractional = self.inverse * self.project(displacement);
        for axis in 0..3 {
            fractional[axis] -= f64::floor(fractional[axis] + 0.5);
        }
        return self.project(self.matrix * fractional);
    }

    /// Wrap an absolute `position` inside this box
    pub fn wrap_position(&self, position: Vector3D) -> Vector3D {
        let image = self.image(position);
        if image == [0, 0, 0] {
            // positions already inside the box are left untouched
            return self.project(position);
        }

        let shift = Vector3D::new(image[0] as f64, image[1] as f64, image[2] as f64);
        return self.project(position - self.matrix * shift);
    }

    /// Get the image flags of an absolute `position`, i.e. how many times the
    /// position needs to be shifted by each lattice vector to end up inside
    /// the box.
    pub fn image(&self, position: Vector3D) -> [i32; 3] {
        let fractional = self.make_fractional(position);
        let mut image = [
            f64::floor(fractional[0]) as i32,
            f64::floor(fractional[1]) as i32,
            f64::floor(fractional[2]) as i32,
        ];
        if self.is_2d() {
            image[2] = 0;
        }
        return image;
    }

    /// Undo the wrapping of `position` by adding back `image` copies of the
    /// lattice vectors.
    pub fn unwrap(&self, position: Vector3D, image: [i32; 3]) -> Vector3D {
        let mut image = Vector3D::new(image[0] as f64, image[1] as f64, image[2] as f64);
        if self.is_2d() {
            image[2] = 0.0;
        }
        return self.project(position + self.matrix * image);
    }

    /// Minimum image distance between the points `u` and `v`
    pub fn distance(&self, u: Vector3D, v: Vector3D) -> f64 {
        self.wrap(v - u).norm()
    }

    /// Remove the z component of `vector` for 2D boxes
    #[inline]
    fn project(&self, mut vector: Vector3D) -> Vector3D {
        if self.is_2d() {
            vector[2] = 0.0;
        }
        return vector;
    }
}
