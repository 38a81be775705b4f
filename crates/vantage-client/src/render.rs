//! GLES renderer: one textured quad covering the full side-by-side image.
//!
//! Two programs share the vertex stage: a plain blit, and an additive
//! simulation that keys near-black pixels to alpha 0 by YUV distance so
//! alpha-blending runtimes can stand in for true additive display.

use glow::HasContext;
use tracing::error;

use vantage_common::{Error, Result};

const VERTEX_SHADER: &str = r#"#version 300 es
in vec3 position;
in vec2 uv;
out vec2 frag_uv;

void main() {
    gl_Position = vec4(position, 1.0);
    frag_uv = uv;
}
"#;

const FRAG_PRELUDE: &str = r#"#version 300 es
precision mediump float;

in vec2 frag_uv;
out vec4 frag_color;
uniform sampler2D textureSampler;
"#;

const FRAG_BLIT: &str = r#"
void main() {
    frag_color = texture(textureSampler, frag_uv);
}
"#;

const FRAG_ADDITIVE_SIM: &str = r#"
const mat4 LINEAR_SRGB_TO_YUV_BT2020_MAT = mat4(
    0.2627, -0.13963,  0.5,    0.0,
    0.6780, -0.36037, -0.3607, 0.0,
    0.0593,  0.5,     -0.1393, 0.0,
    0.0,     0.5,      0.5,    1.0
);

uniform vec3 keyColor; // YUV_BT2020
uniform float keyThreshold;

void main() {
    vec3 color  = texture(textureSampler, frag_uv).rgb;
    vec4 yuv    = LINEAR_SRGB_TO_YUV_BT2020_MAT * vec4(color, 1.0);
    float dist  = distance(keyColor.yz, yuv.yz);
    float alpha = (dist < keyThreshold) ? 0.0 : 1.0;
    frag_color  = vec4(color, alpha);
}
"#;

/// Black in BT.2020 YUV; the chroma plane origin the keyer measures from.
const KEY_COLOR_YUV: [f32; 3] = [0.0, 0.5, 0.5];

pub struct DrawInfo {
    pub texture: u32,
    pub texture_target: u32,
    /// Use the additive-simulation program.
    pub alpha_for_additive: bool,
    pub black_threshold: f32,
}

struct Program {
    id: glow::NativeProgram,
    sampler: Option<glow::NativeUniformLocation>,
    key_color: Option<glow::NativeUniformLocation>,
    key_threshold: Option<glow::NativeUniformLocation>,
}

pub struct Renderer {
    blit: Program,
    additive: Program,
    vao: glow::NativeVertexArray,
    vbo: glow::NativeBuffer,
}

impl Renderer {
    pub fn new(gl: &glow::Context) -> Result<Self> {
        let blit = link_program(gl, VERTEX_SHADER, &[FRAG_PRELUDE, FRAG_BLIT])?;
        let additive = link_program(gl, VERTEX_SHADER, &[FRAG_PRELUDE, FRAG_ADDITIVE_SIM])?;
        let (vao, vbo) = create_quad(gl)?;
        Ok(Self {
            blit,
            additive,
            vao,
            vbo,
        })
    }

    /// Draw the sample across the current viewport. The caller has the EGL
    /// context current and the target framebuffer bound.
    pub fn draw(&self, gl: &glow::Context, info: &DrawInfo) {
        let program = if info.alpha_for_additive {
            &self.additive
        } else {
            &self.blit
        };
        unsafe {
            gl.use_program(Some(program.id));
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(info.texture_target, native_texture(info.texture));
            gl.uniform_1_i32(program.sampler.as_ref(), 0);
            if info.alpha_for_additive {
                gl.uniform_3_f32_slice(program.key_color.as_ref(), &KEY_COLOR_YUV);
                gl.uniform_1_f32(program.key_threshold.as_ref(), info.black_threshold);
            }
            gl.bind_vertex_array(Some(self.vao));
            gl.draw_arrays(glow::TRIANGLE_FAN, 0, 4);
            gl.bind_vertex_array(None);
            gl.bind_texture(info.texture_target, None);
            gl.use_program(None);
        }
    }

    pub fn destroy(&self, gl: &glow::Context) {
        unsafe {
            gl.delete_program(self.blit.id);
            gl.delete_program(self.additive.id);
            gl.delete_vertex_array(self.vao);
            gl.delete_buffer(self.vbo);
        }
    }
}

pub fn native_texture(name: u32) -> Option<glow::NativeTexture> {
    std::num::NonZeroU32::new(name).map(glow::NativeTexture)
}

fn compile_shader(gl: &glow::Context, stage: u32, sources: &[&str]) -> Result<glow::NativeShader> {
    unsafe {
        let shader = gl.create_shader(stage).map_err(Error::gl)?;
        gl.shader_source(shader, &sources.concat());
        gl.compile_shader(shader);
        if !gl.get_shader_compile_status(shader) {
            let log = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            error!("shader compilation failed: {log}");
            return Err(Error::gl(format!("shader compilation failed: {log}")));
        }
        Ok(shader)
    }
}

fn link_program(gl: &glow::Context, vertex: &str, fragment: &[&str]) -> Result<Program> {
    unsafe {
        let vs = compile_shader(gl, glow::VERTEX_SHADER, &[vertex])?;
        let fs = compile_shader(gl, glow::FRAGMENT_SHADER, fragment)?;

        let program = gl.create_program().map_err(Error::gl)?;
        gl.attach_shader(program, vs);
        gl.attach_shader(program, fs);
        gl.bind_attrib_location(program, 0, "position");
        gl.bind_attrib_location(program, 1, "uv");
        gl.link_program(program);
        gl.delete_shader(vs);
        gl.delete_shader(fs);
        if !gl.get_program_link_status(program) {
            let log = gl.get_program_info_log(program);
            gl.delete_program(program);
            error!("program link failed: {log}");
            return Err(Error::gl(format!("program link failed: {log}")));
        }

        Ok(Program {
            id: program,
            sampler: gl.get_uniform_location(program, "textureSampler"),
            key_color: gl.get_uniform_location(program, "keyColor"),
            key_threshold: gl.get_uniform_location(program, "keyThreshold"),
        })
    }
}

fn create_quad(gl: &glow::Context) -> Result<(glow::NativeVertexArray, glow::NativeBuffer)> {
    // x, y, z, u, v — flipped v so the decoded frame lands upright.
    #[rustfmt::skip]
    const QUAD: [f32; 20] = [
        -1.0,  1.0, 0.0, 0.0, 0.0,
        -1.0, -1.0, 0.0, 0.0, 1.0,
         1.0, -1.0, 0.0, 1.0, 1.0,
         1.0,  1.0, 0.0, 1.0, 0.0,
    ];
    const STRIDE: i32 = 5 * std::mem::size_of::<f32>() as i32;

    unsafe {
        let vao = gl.create_vertex_array().map_err(Error::gl)?;
        let vbo = gl.create_buffer().map_err(Error::gl)?;
        gl.bind_vertex_array(Some(vao));
        gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
        gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, float_bytes(&QUAD), glow::STATIC_DRAW);
        gl.vertex_attrib_pointer_f32(0, 3, glow::FLOAT, false, STRIDE, 0);
        gl.enable_vertex_attrib_array(0);
        gl.vertex_attrib_pointer_f32(1, 2, glow::FLOAT, false, STRIDE, 3 * 4);
        gl.enable_vertex_attrib_array(1);
        gl.bind_vertex_array(None);
        gl.bind_buffer(glow::ARRAY_BUFFER, None);
        Ok((vao, vbo))
    }
}

fn float_bytes(values: &[f32]) -> &[u8] {
    // f32 has no padding or invalid byte patterns.
    unsafe {
        std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), std::mem::size_of_val(values))
    }
}
