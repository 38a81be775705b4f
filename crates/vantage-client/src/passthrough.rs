//! Passthrough state keyed on the environment blend mode.
//!
//! Built from the runtime's enumerated blend modes. When the runtime cannot
//! display additive natively but offers alpha blending, additive is simulated
//! by keying near-black pixels transparent in the shader; the projection
//! layer then blends by texture alpha.

use openxr as xr;
use tracing::debug;

use vantage_proto::blend_mode;

fn alpha_layer_flags() -> xr::CompositionLayerFlags {
    xr::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA
        | xr::CompositionLayerFlags::UNPREMULTIPLIED_ALPHA
}

/// Everything a frame submission needs from the passthrough state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Composition {
    /// Blend mode for the end-frame call.
    pub env_blend_mode: xr::EnvironmentBlendMode,
    /// Flags contributed to the projection layer.
    pub projection_flags: xr::CompositionLayerFlags,
    /// Framebuffer clear color.
    pub clear_color: [f32; 4],
    /// Run the additive-to-alpha shader path.
    pub alpha_for_additive: bool,
}

pub struct Passthrough {
    available: Vec<xr::EnvironmentBlendMode>,
    /// No native additive, but alpha blending can stand in for it.
    simulate_additive: bool,
    mode: xr::EnvironmentBlendMode,
}

impl Passthrough {
    pub fn new(available: Vec<xr::EnvironmentBlendMode>) -> Self {
        let has = |mode| available.contains(&mode);
        let simulate_additive = !has(xr::EnvironmentBlendMode::ADDITIVE)
            && has(xr::EnvironmentBlendMode::ALPHA_BLEND);
        Self {
            available,
            simulate_additive,
            mode: xr::EnvironmentBlendMode::OPAQUE,
        }
    }

    pub fn mode(&self) -> xr::EnvironmentBlendMode {
        self.mode
    }

    /// Switch blend mode; transitions are free and immediate. Returns false
    /// when the runtime can neither display nor simulate the request.
    pub fn set_blend_mode(&mut self, mode: xr::EnvironmentBlendMode) -> bool {
        if mode == self.mode {
            return false;
        }
        let reachable = self.available.contains(&mode)
            || (mode == xr::EnvironmentBlendMode::ADDITIVE && self.simulate_additive);
        if !reachable {
            return false;
        }
        debug!("blend mode {:?} -> {:?}", self.mode, mode);
        self.mode = mode;
        true
    }

    /// Apply the blend-mode tag from a down message; zero means no change.
    pub fn set_blend_mode_tag(&mut self, tag: u32) -> bool {
        let mode = match tag {
            blend_mode::OPAQUE => xr::EnvironmentBlendMode::OPAQUE,
            blend_mode::ADDITIVE => xr::EnvironmentBlendMode::ADDITIVE,
            blend_mode::ALPHA_BLEND => xr::EnvironmentBlendMode::ALPHA_BLEND,
            _ => return false,
        };
        self.set_blend_mode(mode)
    }

    pub fn composition(&self) -> Composition {
        match self.mode {
            xr::EnvironmentBlendMode::ADDITIVE if self.simulate_additive => Composition {
                env_blend_mode: xr::EnvironmentBlendMode::ALPHA_BLEND,
                projection_flags: alpha_layer_flags(),
                clear_color: [0.0, 0.0, 0.0, 0.0],
                alpha_for_additive: true,
            },
            xr::EnvironmentBlendMode::ADDITIVE => Composition {
                env_blend_mode: xr::EnvironmentBlendMode::ADDITIVE,
                projection_flags: xr::CompositionLayerFlags::EMPTY,
                clear_color: [0.0, 0.0, 0.0, 1.0],
                alpha_for_additive: false,
            },
            xr::EnvironmentBlendMode::ALPHA_BLEND => Composition {
                env_blend_mode: xr::EnvironmentBlendMode::ALPHA_BLEND,
                projection_flags: alpha_layer_flags(),
                clear_color: [0.0, 0.0, 0.0, 0.0],
                alpha_for_additive: false,
            },
            _ => Composition {
                env_blend_mode: xr::EnvironmentBlendMode::OPAQUE,
                projection_flags: xr::CompositionLayerFlags::EMPTY,
                clear_color: [0.0, 0.0, 0.0, 1.0],
                alpha_for_additive: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_modes() -> Vec<xr::EnvironmentBlendMode> {
        vec![
            xr::EnvironmentBlendMode::OPAQUE,
            xr::EnvironmentBlendMode::ADDITIVE,
            xr::EnvironmentBlendMode::ALPHA_BLEND,
        ]
    }

    #[test]
    fn opaque_row() {
        let p = Passthrough::new(all_modes());
        let c = p.composition();
        assert_eq!(c.env_blend_mode, xr::EnvironmentBlendMode::OPAQUE);
        assert_eq!(c.projection_flags, xr::CompositionLayerFlags::EMPTY);
        assert_eq!(c.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert!(!c.alpha_for_additive);
    }

    #[test]
    fn native_additive_row() {
        let mut p = Passthrough::new(all_modes());
        assert!(p.set_blend_mode(xr::EnvironmentBlendMode::ADDITIVE));
        let c = p.composition();
        assert_eq!(c.env_blend_mode, xr::EnvironmentBlendMode::ADDITIVE);
        assert_eq!(c.projection_flags, xr::CompositionLayerFlags::EMPTY);
        assert_eq!(c.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert!(!c.alpha_for_additive);
    }

    #[test]
    fn simulated_additive_row() {
        let mut p = Passthrough::new(vec![
            xr::EnvironmentBlendMode::OPAQUE,
            xr::EnvironmentBlendMode::ALPHA_BLEND,
        ]);
        assert!(p.set_blend_mode(xr::EnvironmentBlendMode::ADDITIVE));
        let c = p.composition();
        assert_eq!(c.env_blend_mode, xr::EnvironmentBlendMode::ALPHA_BLEND);
        assert!(c
            .projection_flags
            .contains(xr::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA));
        assert_eq!(c.clear_color, [0.0, 0.0, 0.0, 0.0]);
        assert!(c.alpha_for_additive);
    }

    #[test]
    fn alpha_blend_row() {
        let mut p = Passthrough::new(all_modes());
        assert!(p.set_blend_mode(xr::EnvironmentBlendMode::ALPHA_BLEND));
        let c = p.composition();
        assert_eq!(c.env_blend_mode, xr::EnvironmentBlendMode::ALPHA_BLEND);
        assert!(c
            .projection_flags
            .contains(xr::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA));
        assert_eq!(c.clear_color, [0.0, 0.0, 0.0, 0.0]);
        assert!(!c.alpha_for_additive);
    }

    #[test]
    fn unsupported_request_is_refused() {
        let mut p = Passthrough::new(vec![xr::EnvironmentBlendMode::OPAQUE]);
        assert!(!p.set_blend_mode(xr::EnvironmentBlendMode::ADDITIVE));
        assert_eq!(p.mode(), xr::EnvironmentBlendMode::OPAQUE);
    }

    #[test]
    fn down_message_tags_map_to_modes() {
        let mut p = Passthrough::new(all_modes());
        assert!(p.set_blend_mode_tag(vantage_proto::blend_mode::ALPHA_BLEND));
        assert_eq!(p.mode(), xr::EnvironmentBlendMode::ALPHA_BLEND);
        assert!(!p.set_blend_mode_tag(vantage_proto::blend_mode::UNSET));
        assert!(!p.set_blend_mode_tag(99));
        assert_eq!(p.mode(), xr::EnvironmentBlendMode::ALPHA_BLEND);
    }
}
