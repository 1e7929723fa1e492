//! Math types.
//!
//! This module intentionally stays small and deterministic.
//! It avoids SIMD/unsafe and focuses on stable semantics.
//!
//! Conventions: `+Y` is up, the ground plane is `XZ`, and the canonical
//! forward direction is `+Z`.

use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Directions shorter than this are treated as zero.
const DIRECTION_EPSILON: f32 = 1e-6;

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);
    pub const UP: Self = Self::new(0.0, 1.0, 0.0);
    pub const FORWARD: Self = Self::new(0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn len(self) -> f32 {
        self.len_sq().sqrt()
    }

    pub fn distance_sq(self, other: Self) -> f32 {
        (self - other).len_sq()
    }

    /// Drops the vertical component.
    pub fn horizontal(self) -> Self {
        Self::new(self.x, 0.0, self.z)
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Unit vector in the same direction, or `None` for (near) zero vectors.
    pub fn try_normalize(self) -> Option<Self> {
        let len = self.len();
        if len <= DIRECTION_EPSILON || !len.is_finite() {
            return None;
        }
        Some(self * (1.0 / len))
    }

    /// Unit vector in the same direction, falling back to [`Vec3::FORWARD`].
    pub fn normalize_or_forward(self) -> Self {
        self.try_normalize().unwrap_or(Self::FORWARD)
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.x + (to.x - self.x) * t,
            self.y + (to.y - self.y) * t,
            self.z + (to.z - self.z) * t,
        )
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Vec3 {
    type Output = Self;

    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// Unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Rotation about `+Y` by `yaw` followed by a pitch about the local `X` axis.
    pub fn from_yaw_pitch(yaw: f32, pitch: f32) -> Self {
        let (sy, cy) = (yaw * 0.5).sin_cos();
        let (sp, cp) = (pitch * 0.5).sin_cos();
        // q_yaw * q_pitch
        Self {
            x: cy * sp,
            y: sy * cp,
            z: -sy * sp,
            w: cy * cp,
        }
    }

    /// Rotation that turns [`Vec3::FORWARD`] to face `dir`.
    ///
    /// Zero-length directions face forward.
    pub fn look_rotation(dir: Vec3) -> Self {
        let d = dir.normalize_or_forward();
        let yaw = d.x.atan2(d.z);
        let pitch = -d.y.clamp(-1.0, 1.0).asin();
        Self::from_yaw_pitch(yaw, pitch)
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z + self.w * rhs.w
    }

    pub fn normalize(self) -> Self {
        let len = self.dot(self).sqrt();
        if len <= DIRECTION_EPSILON || !len.is_finite() {
            return Self::IDENTITY;
        }
        let inv = 1.0 / len;
        Self {
            x: self.x * inv,
            y: self.y * inv,
            z: self.z * inv,
            w: self.w * inv,
        }
    }

    /// Normalized linear interpolation along the shortest arc.
    pub fn nlerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        let to = if self.dot(to) < 0.0 {
            Self {
                x: -to.x,
                y: -to.y,
                z: -to.z,
                w: -to.w,
            }
        } else {
            to
        };
        if t >= 1.0 {
            return to;
        }
        Self {
            x: self.x + (to.x - self.x) * t,
            y: self.y + (to.y - self.y) * t,
            z: self.z + (to.z - self.z) * t,
            w: self.w + (to.w - self.w) * t,
        }
        .normalize()
    }

    /// Rotates a vector.
    pub fn rotate(self, v: Vec3) -> Vec3 {
        let u = Vec3::new(self.x, self.y, self.z);
        let uv = cross(u, v);
        let uuv = cross(u, uv);
        v + (uv * self.w + uuv) * 2.0
    }
}

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    Vec3::new(
        a.y * b.z - a.z * b.y,
        a.z * b.x - a.x * b.z,
        a.x * b.y - a.y * b.x,
    )
}

/// Position plus orientation of a rendered entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Transform {
    pub const fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self::new(position, Quat::IDENTITY)
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        Self {
            position: self.position.lerp(to.position, t),
            rotation: self.rotation.nlerp(to.rotation, t),
        }
    }

    /// Direction the transform faces.
    pub fn forward(self) -> Vec3 {
        self.rotation.rotate(Vec3::FORWARD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).len() < 1e-4
    }

    #[test]
    fn vec3_lerp_midpoint() {
        let a = Vec3::new(0.0, 0.0, 0.0);
        let b = Vec3::new(2.0, 4.0, 6.0);
        let mid = a.lerp(b, 0.5);
        assert_eq!(mid, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn look_rotation_faces_direction() {
        let dirs = [
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 0.0, -1.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-3.0, -2.0, 5.0),
        ];
        for dir in dirs {
            let q = Quat::look_rotation(dir);
            let fwd = Transform::new(Vec3::ZERO, q).forward();
            assert!(approx(fwd, dir.normalize_or_forward()), "{dir:?} -> {fwd:?}");
        }
    }

    #[test]
    fn zero_direction_faces_forward() {
        let q = Quat::look_rotation(Vec3::ZERO);
        assert!(approx(q.rotate(Vec3::FORWARD), Vec3::FORWARD));
    }

    #[test]
    fn nlerp_endpoints() {
        let a = Quat::look_rotation(Vec3::new(1.0, 0.0, 0.0));
        let b = Quat::look_rotation(Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(a.nlerp(b, 0.0), a.normalize());
        let end = a.nlerp(b, 1.0);
        assert!(approx(end.rotate(Vec3::FORWARD), b.rotate(Vec3::FORWARD)));
    }
}
