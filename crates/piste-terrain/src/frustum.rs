//! View frustum construction and box classification

use glam::Vec3;

/// Result of testing a box against the view frustum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipResult {
    /// Entirely inside: descendants need no further clipping
    NoClip,
    /// Straddles at least one plane
    SomeClip,
    /// Entirely outside at least one plane
    NotVisible,
}

/// A clip plane. Points with `normal · p + d > 0` are outside.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    pub const fn new(normal: Vec3, d: f32) -> Self {
        Self { normal, d }
    }

    pub fn signed_distance(&self, p: Vec3) -> f32 {
        self.normal.dot(p) + self.d
    }
}

/// Names for the six frustum planes, in storage order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrustumPlane {
    Near = 0,
    Far = 1,
    Left = 2,
    Right = 3,
    Top = 4,
    Bottom = 5,
}

/// Camera parameters a frustum is derived from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraParams {
    pub position: Vec3,
    /// View direction; need not be normalized
    pub forward: Vec3,
    pub up: Vec3,
    /// Vertical field of view in degrees
    pub fov_y: f32,
    /// Width / height
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            forward: Vec3::NEG_Z,
            up: Vec3::Y,
            fov_y: 60.0,
            aspect: 4.0 / 3.0,
            near: 0.1,
            far: 75.0,
        }
    }
}

impl CameraParams {
    /// Camera at `position` looking toward `target`, other parameters default
    pub fn looking_at(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            forward: target - position,
            ..Self::default()
        }
    }
}

/// Six clip planes plus, per plane, which box corner lies furthest along its normal.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewFrustum {
    planes: [Plane; 6],
    /// Bit 2 = X, bit 1 = Y, bit 0 = Z: set when the plane normal is positive on that axis
    p_vertex_code: [u8; 6],
}

impl ViewFrustum {
    /// Build world-space planes for a perspective camera.
    pub fn new(camera: &CameraParams) -> Self {
        let f = camera.forward.try_normalize().unwrap_or(Vec3::NEG_Z);
        let r = f.cross(camera.up).try_normalize().unwrap_or(Vec3::X);
        let u = r.cross(f);

        let half_fov = (camera.fov_y * 0.5).to_radians();
        let half_fov_horiz = (half_fov.tan() * camera.aspect).atan();

        // View space looks down -Z
        let view_planes = [
            Plane::new(Vec3::new(0.0, 0.0, 1.0), camera.near),
            Plane::new(Vec3::new(0.0, 0.0, -1.0), -camera.far),
            Plane::new(
                Vec3::new(-half_fov_horiz.cos(), 0.0, half_fov_horiz.sin()),
                0.0,
            ),
            Plane::new(
                Vec3::new(half_fov_horiz.cos(), 0.0, half_fov_horiz.sin()),
                0.0,
            ),
            Plane::new(Vec3::new(0.0, half_fov.cos(), half_fov.sin()), 0.0),
            Plane::new(Vec3::new(0.0, -half_fov.cos(), half_fov.sin()), 0.0),
        ];

        let planes = view_planes.map(|p| {
            let normal = r * p.normal.x + u * p.normal.y - f * p.normal.z;
            Plane::new(normal, p.d - normal.dot(camera.position))
        });

        Self::from_planes(planes)
    }

    /// Use explicit planes, ordered as [`FrustumPlane`]
    pub fn from_planes(planes: [Plane; 6]) -> Self {
        let p_vertex_code = planes.map(|p| {
            let mut code = 0;
            if p.normal.x > 0.0 {
                code |= 4;
            }
            if p.normal.y > 0.0 {
                code |= 2;
            }
            if p.normal.z > 0.0 {
                code |= 1;
            }
            code
        });
        Self {
            planes,
            p_vertex_code,
        }
    }

    pub fn plane(&self, which: FrustumPlane) -> &Plane {
        &self.planes[which as usize]
    }

    /// Classify an axis-aligned box. `min` must be component-wise <= `max`.
    pub fn classify_aabb(&self, min: Vec3, max: Vec3) -> ClipResult {
        let mut intersect = false;

        for (plane, &code) in self.planes.iter().zip(&self.p_vertex_code) {
            let mut p = min;
            let mut n = max;
            if code & 4 != 0 {
                p.x = max.x;
                n.x = min.x;
            }
            if code & 2 != 0 {
                p.y = max.y;
                n.y = min.y;
            }
            if code & 1 != 0 {
                p.z = max.z;
                n.z = min.z;
            }

            if plane.signed_distance(n) > 0.0 {
                return ClipResult::NotVisible;
            }
            if plane.signed_distance(p) > 0.0 {
                intersect = true;
            }
        }

        if intersect {
            ClipResult::SomeClip
        } else {
            ClipResult::NoClip
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward_camera() -> ViewFrustum {
        ViewFrustum::new(&CameraParams {
            position: Vec3::ZERO,
            forward: Vec3::NEG_Z,
            up: Vec3::Y,
            fov_y: 90.0,
            aspect: 1.0,
            near: 1.0,
            far: 100.0,
        })
    }

    #[test]
    fn box_in_front_is_inside() {
        let frustum = forward_camera();
        let r = frustum.classify_aabb(Vec3::new(-1.0, -1.0, -20.0), Vec3::new(1.0, 1.0, -10.0));
        assert_eq!(r, ClipResult::NoClip);
    }

    #[test]
    fn box_behind_camera_or_past_far_is_culled() {
        let frustum = forward_camera();
        let behind = frustum.classify_aabb(Vec3::new(-1.0, -1.0, 5.0), Vec3::new(1.0, 1.0, 10.0));
        assert_eq!(behind, ClipResult::NotVisible);
        let past_far =
            frustum.classify_aabb(Vec3::new(-1.0, -1.0, -300.0), Vec3::new(1.0, 1.0, -200.0));
        assert_eq!(past_far, ClipResult::NotVisible);
    }

    #[test]
    fn box_off_to_the_side_is_culled() {
        let frustum = forward_camera();
        // 90 degree fov: at z = -10 the view spans x in [-10, 10]
        let r = frustum.classify_aabb(Vec3::new(30.0, -1.0, -11.0), Vec3::new(40.0, 1.0, -10.0));
        assert_eq!(r, ClipResult::NotVisible);
        let above = frustum.classify_aabb(Vec3::new(-1.0, 30.0, -11.0), Vec3::new(1.0, 40.0, -10.0));
        assert_eq!(above, ClipResult::NotVisible);
    }

    #[test]
    fn box_straddling_a_plane_is_kept() {
        let frustum = forward_camera();
        let far = frustum.classify_aabb(Vec3::new(-1.0, -1.0, -150.0), Vec3::new(1.0, 1.0, -50.0));
        assert_eq!(far, ClipResult::SomeClip);
        let side = frustum.classify_aabb(Vec3::new(5.0, -1.0, -11.0), Vec3::new(40.0, 1.0, -10.0));
        assert_eq!(side, ClipResult::SomeClip);
    }

    #[test]
    fn planes_follow_camera_orientation() {
        // Looking down +X from x = 10
        let frustum = ViewFrustum::new(&CameraParams {
            position: Vec3::new(10.0, 0.0, 0.0),
            forward: Vec3::X,
            far: 50.0,
            ..CameraParams::default()
        });
        let ahead = frustum.classify_aabb(Vec3::new(20.0, -1.0, -1.0), Vec3::new(22.0, 1.0, 1.0));
        assert_eq!(ahead, ClipResult::NoClip);
        let behind = frustum.classify_aabb(Vec3::new(0.0, -1.0, -1.0), Vec3::new(2.0, 1.0, 1.0));
        assert_eq!(behind, ClipResult::NotVisible);

        let far = frustum.plane(FrustumPlane::Far);
        assert!(far.signed_distance(Vec3::new(70.0, 0.0, 0.0)) > 0.0);
        assert!(far.signed_distance(Vec3::new(50.0, 0.0, 0.0)) < 0.0);
    }
}
