use glam::{Mat4, Vec3};

use rift_core::math::Aabb;

const W_EPSILON: f32 = 1e-5;

/// Axis-aligned interval in post-divide clip space: how much of a camera's
/// viewport something occupies. x and y are NDC in [-1, 1], z is depth in
/// [0, 1] for anything in front of the camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewWindow {
    pub min: Vec3,
    pub max: Vec3,
}

impl ViewWindow {
    /// Nothing accumulated yet. Acts as the identity of [`combine`].
    ///
    /// [`combine`]: ViewWindow::combine
    pub const EMPTY: Self = Self {
        min: Vec3::INFINITY,
        max: Vec3::NEG_INFINITY,
    };

    /// The whole viewport with the full forward depth range.
    pub const FULL: Self = Self {
        min: Vec3::new(-1.0, -1.0, 0.0),
        max: Vec3::new(1.0, 1.0, 1.0),
    };

    pub fn is_valid(&self) -> bool {
        self.min.cmple(self.max).all()
    }

    pub fn add_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Projects the 8 corners of an oriented box through `view_proj`. A
    /// corner at or behind the eye plane flips sign under the divide and
    /// cannot be window-culled in x/y, so the window widens to the full
    /// screen on those axes and only depth stays tight.
    pub fn of_bounds(view_proj: Mat4, local_bounds: Aabb, local_to_world: Mat4) -> Self {
        let mut window = Self::EMPTY;
        for corner in local_bounds.corners() {
            let world = local_to_world.transform_point3(corner);
            let clip = view_proj * world.extend(1.0);
            if clip.w <= W_EPSILON {
                let z = clip.z / clip.w;
                window.min.x = f32::NEG_INFINITY;
                window.min.y = f32::NEG_INFINITY;
                window.max.x = f32::INFINITY;
                window.max.y = f32::INFINITY;
                window.min.z = window.min.z.min(z);
                window.max.z = window.max.z.max(z);
            } else {
                window.add_point(clip.truncate() / clip.w);
            }
        }
        window
    }

    /// Union. An invalid operand contributes nothing.
    pub fn combine(a: Self, b: Self) -> Self {
        Self {
            min: a.min.min(b.min),
            max: a.max.max(b.max),
        }
    }

    /// Intersects this window down to `outer`.
    pub fn clamp_inside(&mut self, outer: &Self) {
        self.min = self.min.max(outer.min);
        self.max = self.max.min(outer.max);
    }

    /// Strict overlap between this window's forward-depth region and
    /// `outer`'s on all three axes. Touching edges do not count.
    pub fn is_visible_through(&self, outer: &Self) -> bool {
        if !self.is_valid() || !outer.is_valid() {
            return false;
        }
        let near = self.min.z.max(0.0);
        let outer_near = outer.min.z.max(0.0);
        self.min.x < outer.max.x
            && self.max.x > outer.min.x
            && self.min.y < outer.max.y
            && self.max.y > outer.min.y
            && near < outer.max.z
            && self.max.z > outer_near
    }

    /// Pixel rectangle `(x, y, w, h)` this window covers on a target,
    /// y-down, clamped to the target and never degenerate.
    pub fn viewport_rect(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        if !self.is_valid() || width == 0 || height == 0 {
            return (0, 0, width.max(1), height.max(1));
        }
        let fw = width as f32;
        let fh = height as f32;
        let x0 = ((self.min.x + 1.0) * 0.5 * fw).clamp(0.0, fw);
        let x1 = ((self.max.x + 1.0) * 0.5 * fw).clamp(0.0, fw);
        let y0 = ((1.0 - self.max.y) * 0.5 * fh).clamp(0.0, fh);
        let y1 = ((1.0 - self.min.y) * 0.5 * fh).clamp(0.0, fh);

        let x = (x0.floor() as u32).min(width - 1);
        let y = (y0.floor() as u32).min(height - 1);
        let w = (x1.ceil() as u32).saturating_sub(x).clamp(1, width - x);
        let h = (y1.ceil() as u32).saturating_sub(y).clamp(1, height - y);
        (x, y, w, h)
    }
}

#[cfg(test)]
mod tests {
    use glam::{Mat4, Vec3};

    use super::ViewWindow;
    use rift_core::math::Aabb;

    fn test_view_proj() -> Mat4 {
        let view = Mat4::look_to_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::NEG_Z, Vec3::Y);
        let proj = Mat4::perspective_rh(90.0_f32.to_radians(), 1.0, 0.1, 100.0);
        proj * view
    }

    #[test]
    fn empty_is_the_combine_identity() {
        let w = ViewWindow {
            min: Vec3::new(-0.5, -0.25, 0.1),
            max: Vec3::new(0.5, 0.25, 0.9),
        };
        assert_eq!(ViewWindow::combine(ViewWindow::EMPTY, w), w);
        assert_eq!(ViewWindow::combine(w, ViewWindow::EMPTY), w);
        assert!(!ViewWindow::EMPTY.is_valid());
    }

    #[test]
    fn bounds_in_front_project_to_a_tight_window() {
        let bounds = Aabb::from_half_extents(Vec3::new(1.0, 1.0, 0.05));
        let window = ViewWindow::of_bounds(test_view_proj(), bounds, Mat4::IDENTITY);

        assert!(window.is_valid());
        assert!(window.min.x > -1.0 && window.max.x < 1.0);
        assert!(window.min.y > -1.0 && window.max.y < 1.0);
        assert!(window.min.z > 0.0 && window.max.z < 1.0);
        assert!(window.is_visible_through(&ViewWindow::FULL));
    }

    #[test]
    fn bounds_straddling_the_eye_widen_to_the_whole_screen() {
        // box centered on the camera position
        let bounds = Aabb::from_half_extents(Vec3::splat(1.0));
        let window = ViewWindow::of_bounds(
            test_view_proj(),
            bounds,
            Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0)),
        );

        assert_eq!(window.min.x, f32::NEG_INFINITY);
        assert_eq!(window.max.x, f32::INFINITY);
        assert_eq!(window.min.y, f32::NEG_INFINITY);
        assert_eq!(window.max.y, f32::INFINITY);
        // depth is still tracked tightly
        assert!(window.min.z > 0.0 && window.min.z < 1.0);
        assert!(window.is_visible_through(&ViewWindow::FULL));
    }

    #[test]
    fn bounds_fully_behind_are_not_visible() {
        let bounds = Aabb::from_half_extents(Vec3::splat(0.5));
        let window = ViewWindow::of_bounds(
            test_view_proj(),
            bounds,
            Mat4::from_translation(Vec3::new(0.0, 0.0, 20.0)),
        );

        assert!(!window.is_visible_through(&ViewWindow::FULL));
    }

    #[test]
    fn separated_windows_are_not_visible_through() {
        let left = ViewWindow {
            min: Vec3::new(-1.0, -1.0, 0.0),
            max: Vec3::new(-0.2, 1.0, 1.0),
        };
        let right = ViewWindow {
            min: Vec3::new(0.2, -1.0, 0.0),
            max: Vec3::new(1.0, 1.0, 1.0),
        };
        assert!(!left.is_visible_through(&right));
        assert!(!right.is_visible_through(&left));

        // touching edges count as zero overlap
        let touching = ViewWindow {
            min: Vec3::new(-0.2, -1.0, 0.0),
            max: Vec3::new(0.2, 1.0, 1.0),
        };
        assert!(!left.is_visible_through(&touching));

        let overlapping = ViewWindow {
            min: Vec3::new(-0.4, -1.0, 0.0),
            max: Vec3::new(0.2, 1.0, 1.0),
        };
        assert!(left.is_visible_through(&overlapping));
        assert!(overlapping.is_visible_through(&left));
    }

    #[test]
    fn clamp_inside_intersects() {
        let mut inner = ViewWindow {
            min: Vec3::new(-2.0, -0.5, 0.0),
            max: Vec3::new(2.0, 0.5, 2.0),
        };
        inner.clamp_inside(&ViewWindow::FULL);
        assert_eq!(inner.min, Vec3::new(-1.0, -0.5, 0.0));
        assert_eq!(inner.max, Vec3::new(1.0, 0.5, 1.0));
    }

    #[test]
    fn viewport_rect_maps_ndc_to_pixels() {
        assert_eq!(ViewWindow::FULL.viewport_rect(800, 600), (0, 0, 800, 600));

        // upper-right quadrant, y flipped to the top half of the target
        let quadrant = ViewWindow {
            min: Vec3::new(0.0, 0.0, 0.0),
            max: Vec3::new(1.0, 1.0, 1.0),
        };
        assert_eq!(quadrant.viewport_rect(800, 600), (400, 0, 400, 300));
    }
}
