// src/geometry.rs - Vector and plane math used for positions and bed fitting
use std::ops::{Add, AddAssign, Div, Index, IndexMut, Mul, Sub, SubAssign};

/// Machine axes, in the order they are stored in a [`Vector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
    E,
}

impl Axis {
    pub const ALL: [Axis; 4] = [Axis::X, Axis::Y, Axis::Z, Axis::E];

    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::E => 3,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::E => 'E',
        }
    }
}

/// Four-component vector: X, Y, Z and the extruder axis.
///
/// Doubles as a 3D point for plane fitting, in which case `e` is unused.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Vector {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub e: f32,
}

impl Vector {
    pub const ZERO: Vector = Vector { x: 0.0, y: 0.0, z: 0.0, e: 0.0 };

    pub const fn new(x: f32, y: f32, z: f32, e: f32) -> Self {
        Self { x, y, z, e }
    }

    pub const fn point(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z, e: 0.0 }
    }

    /// Euclidean length over all four components.
    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z + self.e * self.e).sqrt()
    }

    /// Length of the X/Y/Z part only.
    pub fn spatial_length(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Divides every component by the length. A zero vector yields non-finite
    /// components; callers must check the length first.
    pub fn normalize(&self) -> Vector {
        *self / self.length()
    }

    pub fn dot(&self, other: &Vector) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z + self.e * other.e
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.e.is_finite()
    }

    /// Linear interpolation, `t` in `[0, 1]`.
    pub fn lerp(&self, to: &Vector, t: f32) -> Vector {
        *self + (*to - *self) * t
    }
}

impl Index<Axis> for Vector {
    type Output = f32;

    fn index(&self, axis: Axis) -> &f32 {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
            Axis::E => &self.e,
        }
    }
}

impl IndexMut<Axis> for Vector {
    fn index_mut(&mut self, axis: Axis) -> &mut f32 {
        match axis {
            Axis::X => &mut self.x,
            Axis::Y => &mut self.y,
            Axis::Z => &mut self.z,
            Axis::E => &mut self.e,
        }
    }
}

impl Add for Vector {
    type Output = Vector;

    fn add(self, rhs: Vector) -> Vector {
        Vector::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z, self.e + rhs.e)
    }
}

impl AddAssign for Vector {
    fn add_assign(&mut self, rhs: Vector) {
        *self = *self + rhs;
    }
}

impl Sub for Vector {
    type Output = Vector;

    fn sub(self, rhs: Vector) -> Vector {
        Vector::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z, self.e - rhs.e)
    }
}

impl SubAssign for Vector {
    fn sub_assign(&mut self, rhs: Vector) {
        *self = *self - rhs;
    }
}

impl Mul<f32> for Vector {
    type Output = Vector;

    fn mul(self, rhs: f32) -> Vector {
        Vector::new(self.x * rhs, self.y * rhs, self.z * rhs, self.e * rhs)
    }
}

impl Div<f32> for Vector {
    type Output = Vector;

    fn div(self, rhs: f32) -> Vector {
        Vector::new(self.x / rhs, self.y / rhs, self.z / rhs, self.e / rhs)
    }
}

/// A plane given by a point on it and its unit normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub point: Vector,
    pub normal: Vector,
}

impl Plane {
    /// The horizontal plane through the origin.
    pub const FLAT: Plane = Plane {
        point: Vector::ZERO,
        normal: Vector::point(0.0, 0.0, 1.0),
    };

    /// Least-squares fit of `z = a*x + b*y + c` through the given points.
    ///
    /// Returns `None` when the points do not span the X/Y plane (fewer than three
    /// non-collinear points).
    pub fn fit(points: &[Vector]) -> Option<Plane> {
        let n = points.len() as f64;
        let (mut sx, mut sy, mut sz) = (0.0f64, 0.0f64, 0.0f64);
        let (mut sxx, mut syy, mut sxy, mut sxz, mut syz) = (0.0f64, 0.0f64, 0.0f64, 0.0f64, 0.0f64);
        for p in points {
            let (x, y, z) = (p.x as f64, p.y as f64, p.z as f64);
            sx += x;
            sy += y;
            sz += z;
            sxx += x * x;
            syy += y * y;
            sxy += x * y;
            sxz += x * z;
            syz += y * z;
        }

        // Normal equations, solved with Cramer's rule.
        let m = [[sxx, sxy, sx], [sxy, syy, sy], [sx, sy, n]];
        let rhs = [sxz, syz, sz];
        let det = det3(&m);
        if det.abs() < 1e-9 {
            return None;
        }
        let mut solution = [0.0f64; 3];
        for (col, value) in solution.iter_mut().enumerate() {
            let mut replaced = m;
            for row in 0..3 {
                replaced[row][col] = rhs[row];
            }
            *value = det3(&replaced) / det;
        }
        let [a, b, c] = solution;

        let normal = Vector::point(-a as f32, -b as f32, 1.0).normalize();
        Some(Plane {
            point: Vector::point(0.0, 0.0, c as f32),
            normal,
        })
    }

    /// Height of the plane above (x, y).
    pub fn height_at(&self, x: f32, y: f32) -> f32 {
        self.point.z - (self.normal.x * (x - self.point.x) + self.normal.y * (y - self.point.y)) / self.normal.z
    }
}

fn det3(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1]) - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}
