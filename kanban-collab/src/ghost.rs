//! Cursor ghost: the floating copy of a card or list a peer is dragging.
//!
//! ## Placement
//!
//! ```text
//! left = x_norm · viewport.width − column_width / 2
//! top  = y_norm · viewport.height
//! ```
//!
//! `column_width` is measured locally and debounced so a window resize does
//! not make the ghost jitter. Placement is smoothed toward the target with the
//! same frame-rate independent lerp used for remote cursors.

use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::drag::RemoteDragProjection;
use crate::protocol::NormPoint;

pub const DEFAULT_COLUMN_WIDTH: f32 = 272.0;
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(150);
/// Higher is smoother but lags more; 0 disables smoothing.
pub const DEFAULT_SMOOTHING: f32 = 0.85;

/// 2D position in viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Linear interpolation toward `target` by factor `t` ∈ [0, 1].
    pub fn lerp(&self, target: &Vec2, t: f32) -> Vec2 {
        Vec2 {
            x: self.x + (target.x - self.x) * t,
            y: self.y + (target.y - self.y) * t,
        }
    }
}

/// Size of the viewer's board viewport, in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(1280.0, 720.0)
    }
}

/// Stable per-user color for the ghost border and name tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GhostColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl GhostColor {
    /// Hue derived from the user id, fixed saturation and lightness.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    /// `#rrggbb`, for style attributes.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// The overlay never intercepts input; drops land on the board below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerEvents {
    None,
}

/// Render data for one frame of the ghost.
#[derive(Debug, Clone, PartialEq)]
pub struct GhostOverlay {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub user_name: String,
    pub item_name: String,
    pub color: GhostColor,
    pub pointer_events: PointerEvents,
}

/// Debounced column width. A sample is committed once no newer sample has
/// arrived for the debounce period.
#[derive(Debug, Clone)]
pub struct ColumnWidthSampler {
    committed: f32,
    pending: Option<(f32, Instant)>,
    debounce: Duration,
}

impl ColumnWidthSampler {
    pub fn new(initial: f32, debounce: Duration) -> Self {
        Self {
            committed: initial,
            pending: None,
            debounce,
        }
    }

    pub fn observe_resize(&mut self, width: f32, now: Instant) {
        if width.is_finite() && width > 0.0 {
            self.pending = Some((width, now));
        }
    }

    /// Width to render with at `now`, committing a settled sample first.
    pub fn current(&mut self, now: Instant) -> f32 {
        if let Some((width, at)) = self.pending {
            if now.saturating_duration_since(at) >= self.debounce {
                self.committed = width;
                self.pending = None;
            }
        }
        self.committed
    }
}

/// Target placement, before smoothing.
pub fn place(pointer: NormPoint, viewport: Viewport, column_width: f32) -> Vec2 {
    Vec2::new(
        pointer.x * viewport.width - column_width / 2.0,
        pointer.y * viewport.height,
    )
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    user_id: Uuid,
    draggable_id: Uuid,
    position: Vec2,
    at: Instant,
}

pub struct GhostRenderer {
    viewport: Viewport,
    width: ColumnWidthSampler,
    smoothing: f32,
    tracked: Option<Tracked>,
}

impl GhostRenderer {
    pub fn new(debounce: Duration, smoothing: f32) -> Self {
        Self {
            viewport: Viewport::default(),
            width: ColumnWidthSampler::new(DEFAULT_COLUMN_WIDTH, debounce),
            smoothing: smoothing.clamp(0.0, 0.999),
            tracked: None,
        }
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    pub fn observe_column_width(&mut self, width: f32, now: Instant) {
        self.width.observe_resize(width, now);
    }

    /// Overlay for the current projection, or `None` when nobody is dragging.
    pub fn frame(
        &mut self,
        projection: Option<&RemoteDragProjection>,
        now: Instant,
    ) -> Option<GhostOverlay> {
        let Some(projection) = projection else {
            self.tracked = None;
            return None;
        };

        let width = self.width.current(now);
        let target = place(projection.pointer, self.viewport, width);

        let position = match self.tracked {
            // Same drag as last frame: ease toward the new target.
            Some(prev)
                if prev.user_id == projection.user_id
                    && prev.draggable_id == projection.draggable_id =>
            {
                let dt = now.saturating_duration_since(prev.at).as_secs_f32();
                let t = if self.smoothing == 0.0 {
                    1.0
                } else {
                    1.0 - self.smoothing.powf(dt * 60.0)
                };
                prev.position.lerp(&target, t.clamp(0.0, 1.0))
            }
            // A new drag appears where the pointer is.
            _ => target,
        };
        self.tracked = Some(Tracked {
            user_id: projection.user_id,
            draggable_id: projection.draggable_id,
            position,
            at: now,
        });

        Some(GhostOverlay {
            left: position.x,
            top: position.y,
            width,
            user_name: projection.user_name.clone(),
            item_name: projection.item_name.clone(),
            color: GhostColor::from_uuid(projection.user_id),
            pointer_events: PointerEvents::None,
        })
    }
}

impl Default for GhostRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE, DEFAULT_SMOOTHING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drag::projection_from_start;
    use kanban_core::{CardSnapshot, DragLocation, ItemSnapshot};

    fn projection(user: Uuid, pointer: NormPoint) -> RemoteDragProjection {
        let item = ItemSnapshot::Card(CardSnapshot {
            id: Uuid::from_u128(7),
            title: "Write docs".into(),
            description: String::new(),
            labels: Vec::new(),
            media: Vec::new(),
        });
        projection_from_start(
            user,
            "Alice".into(),
            item.id(),
            DragLocation::new(Uuid::new_v4(), 0),
            &item,
            pointer,
        )
    }

    #[test]
    fn test_place_centers_on_column() {
        let pos = place(NormPoint::new(0.5, 0.25), Viewport::new(1000.0, 800.0), 200.0);
        assert_eq!(pos, Vec2::new(400.0, 200.0));
    }

    #[test]
    fn test_vec2_lerp() {
        let a = Vec2::new(0.0, 0.0);
        let b = Vec2::new(10.0, 20.0);
        assert_eq!(a.lerp(&b, 0.5), Vec2::new(5.0, 10.0));
        assert_eq!(a.lerp(&b, 1.0), b);
    }

    #[test]
    fn test_color_stable_per_user() {
        let id = Uuid::from_u128(42);
        assert_eq!(GhostColor::from_uuid(id), GhostColor::from_uuid(id));
        assert_ne!(
            GhostColor::from_uuid(Uuid::from_u128(1)),
            GhostColor::from_uuid(Uuid::from_u128(180))
        );
        let hex = GhostColor::from_uuid(id).to_hex();
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
    }

    #[test]
    fn test_width_debounce_commits_after_quiet_period() {
        let t0 = Instant::now();
        let mut sampler = ColumnWidthSampler::new(272.0, Duration::from_millis(150));

        sampler.observe_resize(300.0, t0);
        assert_eq!(sampler.current(t0 + Duration::from_millis(100)), 272.0);

        // A newer sample restarts the quiet period.
        sampler.observe_resize(320.0, t0 + Duration::from_millis(100));
        assert_eq!(sampler.current(t0 + Duration::from_millis(200)), 272.0);
        assert_eq!(sampler.current(t0 + Duration::from_millis(250)), 320.0);
    }

    #[test]
    fn test_width_ignores_bogus_samples() {
        let t0 = Instant::now();
        let mut sampler = ColumnWidthSampler::new(272.0, Duration::ZERO);
        sampler.observe_resize(0.0, t0);
        sampler.observe_resize(f32::NAN, t0);
        assert_eq!(sampler.current(t0), 272.0);
    }

    #[test]
    fn test_overlay_only_while_projection_exists() {
        let mut renderer = GhostRenderer::new(Duration::ZERO, 0.0);
        renderer.set_viewport(Viewport::new(1000.0, 500.0));
        let now = Instant::now();
        assert!(renderer.frame(None, now).is_none());

        let proj = projection(Uuid::from_u128(3), NormPoint::new(0.5, 0.5));
        let overlay = renderer.frame(Some(&proj), now).unwrap();
        assert_eq!(overlay.left, 500.0 - DEFAULT_COLUMN_WIDTH / 2.0);
        assert_eq!(overlay.top, 250.0);
        assert_eq!(overlay.width, DEFAULT_COLUMN_WIDTH);
        assert_eq!(overlay.user_name, "Alice");
        assert_eq!(overlay.item_name, "Write docs");
        assert_eq!(overlay.pointer_events, PointerEvents::None);

        assert!(renderer.frame(None, now).is_none());
    }

    #[test]
    fn test_smoothing_eases_toward_target() {
        let mut renderer = GhostRenderer::new(Duration::ZERO, DEFAULT_SMOOTHING);
        renderer.set_viewport(Viewport::new(1000.0, 1000.0));
        let user = Uuid::from_u128(3);
        let t0 = Instant::now();

        let mut proj = projection(user, NormPoint::new(0.5, 0.0));
        let first = renderer.frame(Some(&proj), t0).unwrap();

        proj.apply_coords(NormPoint::new(0.5, 1.0), 1);
        let next = renderer.frame(Some(&proj), t0 + Duration::from_millis(16)).unwrap();
        assert!(next.top > first.top);
        assert!(next.top < 1000.0);

        // Long enough that the ghost has effectively arrived.
        let settled = renderer.frame(Some(&proj), t0 + Duration::from_secs(2)).unwrap();
        assert!((settled.top - 1000.0).abs() < 0.5);
    }
}
