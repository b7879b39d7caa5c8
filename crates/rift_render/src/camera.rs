use glam::{Mat4, Vec3, Vec4};

use crate::window::ViewWindow;

const PORTAL_CLIP_BIAS: f32 = 0.025;

/// One physical or virtual camera: a rigid pose plus a perspective lens.
/// Child portal cameras are derived by composing a teleport onto the pose,
/// never by mutating the original.
#[derive(Debug, Clone, Copy)]
pub struct EyeCamera {
    /// Camera local to world. Forward is -Z, up is +Y.
    pub pose: Mat4,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for EyeCamera {
    fn default() -> Self {
        Self {
            pose: Mat4::IDENTITY,
            fov: 70.0_f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl EyeCamera {
    pub fn looking(position: Vec3, forward: Vec3, up: Vec3) -> Self {
        Self {
            pose: Mat4::look_to_rh(position, forward, up).inverse(),
            ..Self::default()
        }
    }

    pub fn position(&self) -> Vec3 {
        self.pose.w_axis.truncate()
    }

    pub fn forward(&self) -> Vec3 {
        (-self.pose.z_axis.truncate()).normalize_or_zero()
    }

    pub fn view_matrix(&self) -> Mat4 {
        self.pose.inverse()
    }

    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(
            self.fov,
            self.aspect.max(0.0001),
            self.near.max(0.0001),
            self.far.max(self.near + 0.0001),
        )
    }

    pub fn view_projection(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// The same camera seen through a portal: the teleport is composed onto
    /// the pose, the lens is untouched.
    pub fn teleported(&self, teleport: Mat4) -> Self {
        Self {
            pose: teleport * self.pose,
            ..*self
        }
    }

    /// Off-center perspective whose frustum covers exactly the window's x/y
    /// rectangle of this camera's full frustum. The full window reproduces
    /// `projection_matrix` and a degenerate window falls back to it.
    pub fn window_fit_projection(&self, window: &ViewWindow) -> Mat4 {
        let near = self.near.max(0.0001);
        let far = self.far.max(near + 0.0001);
        let half_h = near * (self.fov * 0.5).tan();
        let half_w = half_h * self.aspect.max(0.0001);

        let left = window.min.x.clamp(-1.0, 1.0) * half_w;
        let right = window.max.x.clamp(-1.0, 1.0) * half_w;
        let bottom = window.min.y.clamp(-1.0, 1.0) * half_h;
        let top = window.max.y.clamp(-1.0, 1.0) * half_h;
        if right - left <= f32::EPSILON || top - bottom <= f32::EPSILON {
            return self.projection_matrix();
        }

        let r = far / (near - far);
        Mat4::from_cols(
            Vec4::new(2.0 * near / (right - left), 0.0, 0.0, 0.0),
            Vec4::new(0.0, 2.0 * near / (top - bottom), 0.0, 0.0),
            Vec4::new(
                (right + left) / (right - left),
                (top + bottom) / (top - bottom),
                r,
                -1.0,
            ),
            Vec4::new(0.0, 0.0, r * near, 0.0),
        )
    }
}

/// Rebuilds `projection` so its near plane lies on the given world-space
/// plane, clipping everything between the exit surface and the virtual
/// camera. The plane is flipped to face away from the eye and biased
/// slightly off the surface.
pub fn clip_projection_at_plane(
    view: Mat4,
    projection: Mat4,
    plane_point: Vec3,
    plane_normal: Vec3,
    eye: Vec3,
) -> Mat4 {
    let clip_normal = if (eye - plane_point).dot(plane_normal) >= 0.0 {
        -plane_normal
    } else {
        plane_normal
    };
    let clip_point = plane_point + clip_normal * PORTAL_CLIP_BIAS;
    let plane_world = Vec4::new(
        clip_normal.x,
        clip_normal.y,
        clip_normal.z,
        -clip_normal.dot(clip_point),
    );
    let plane_camera = view.inverse().transpose() * plane_world;
    apply_oblique_clip(projection, plane_camera)
}

fn apply_oblique_clip(proj: Mat4, clip_plane_camera: Vec4) -> Mat4 {
    let q = proj.inverse()
        * Vec4::new(
            clip_plane_camera.x.signum(),
            clip_plane_camera.y.signum(),
            1.0,
            1.0,
        );
    let denom = clip_plane_camera.dot(q);
    if denom.abs() < 1e-5 {
        return proj;
    }

    // zero-to-one depth: the plane lands on z = 0 and the far corner keeps
    // z = w
    let c = clip_plane_camera * (1.0 / denom);
    let mut m = proj.to_cols_array_2d();
    m[0][2] = c.x;
    m[1][2] = c.y;
    m[2][2] = c.z;
    m[3][2] = c.w;
    Mat4::from_cols_array_2d(&m)
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3, Vec4};

    use super::{clip_projection_at_plane, EyeCamera};
    use crate::window::ViewWindow;

    fn assert_close(a: Mat4, b: Mat4) {
        let da = a.to_cols_array();
        let db = b.to_cols_array();
        for (x, y) in da.iter().zip(db.iter()) {
            assert!((x - y).abs() < 1e-4, "matrices differ: {a:?} vs {b:?}");
        }
    }

    #[test]
    fn full_window_fit_reproduces_the_base_projection() {
        let camera = EyeCamera::default();
        assert_close(
            camera.window_fit_projection(&ViewWindow::FULL),
            camera.projection_matrix(),
        );
    }

    #[test]
    fn window_fit_maps_the_window_corners_to_the_ndc_edges() {
        let camera = EyeCamera::default();
        let window = ViewWindow {
            min: Vec3::new(-0.5, 0.0, 0.0),
            max: Vec3::new(0.5, 0.8, 1.0),
        };

        // eye-space point whose base projection lands on the window's left
        // edge, at the window's vertical midpoint
        let base = camera.projection_matrix();
        let eye_point = Vec3::new(-0.5 * 10.0 / base.x_axis.x, 0.4 * 10.0 / base.y_axis.y, -10.0);
        let check = base * eye_point.extend(1.0);
        assert!((check.x / check.w + 0.5).abs() < 1e-3);
        assert!((check.y / check.w - 0.4).abs() < 1e-3);

        let fitted = camera.window_fit_projection(&window) * eye_point.extend(1.0);
        assert!((fitted.x / fitted.w + 1.0).abs() < 1e-3);
        assert!((fitted.y / fitted.w).abs() < 1e-3);
    }

    #[test]
    fn teleported_camera_moves_with_the_portal() {
        let camera = EyeCamera::looking(Vec3::new(0.0, 1.0, 5.0), Vec3::NEG_Z, Vec3::Y);
        let teleport = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0));
        let through = camera.teleported(teleport);

        assert!((through.position() - Vec3::new(10.0, 1.0, 5.0)).length() < 1e-4);
        assert!((through.forward() - camera.forward()).length() < 1e-4);
        assert_eq!(through.fov, camera.fov);
    }

    #[test]
    fn oblique_clip_moves_the_near_plane_to_the_surface() {
        let camera = EyeCamera::looking(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z, Vec3::Y);
        let view = camera.view_matrix();
        let clipped = clip_projection_at_plane(
            view,
            camera.projection_matrix(),
            Vec3::ZERO,
            Vec3::Z,
            camera.position(),
        );

        // a point just behind the portal plane stays in front of the new
        // near plane; a point well in front of it is clipped away
        let behind = clipped * view * Vec4::new(0.0, 0.0, -1.0, 1.0);
        let before = clipped * view * Vec4::new(0.0, 0.0, 1.0, 1.0);
        assert!(behind.z / behind.w > 0.0);
        assert!(before.z / before.w < 0.0);
    }
}
