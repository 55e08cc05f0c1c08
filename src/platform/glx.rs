//! GLX device
//!
//! Owns an Xlib display next to the x11rb connection because GLX needs one.
//! Pixmaps are bound with GLX_EXT_texture_from_pixmap.

use std::ffi::{CStr, CString};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tracing::{debug, info, trace, warn};
use x11_dl::glx::{self, Glx};
use x11_dl::xlib::{self, Xlib};
use x11rb::rust_connection::RustConnection;

use super::fence::X11FenceOps;
use crate::compositor::backend::ResetStatus;
use crate::compositor::backend::opengl::{DrawCall, GlDevice, PixmapBinding};
use crate::compositor::sync::FenceOps;
use crate::compositor::texture::GlResource;
use crate::error::BackendError;
use crate::shared::geometry::{Rect, Size};
use crate::shared::image::Image;

// GLX_EXT_texture_from_pixmap
const GLX_BIND_TO_TEXTURE_RGB_EXT: i32 = 0x20D0;
const GLX_BIND_TO_TEXTURE_RGBA_EXT: i32 = 0x20D1;
const GLX_Y_INVERTED_EXT: i32 = 0x20D4;
const GLX_TEXTURE_FORMAT_EXT: i32 = 0x20D5;
const GLX_TEXTURE_TARGET_EXT: i32 = 0x20D6;
const GLX_MIPMAP_TEXTURE_EXT: i32 = 0x20D7;
const GLX_TEXTURE_FORMAT_RGB_EXT: i32 = 0x20D9;
const GLX_TEXTURE_FORMAT_RGBA_EXT: i32 = 0x20DA;
const GLX_TEXTURE_2D_EXT: i32 = 0x20DC;
const GLX_FRONT_LEFT_EXT: i32 = 0x20DE;

// GLX_EXT_buffer_age
const GLX_BACK_BUFFER_AGE_EXT: i32 = 0x20F4;

// GLX_ARB_create_context_robustness
const GLX_CONTEXT_FLAGS_ARB: i32 = 0x2094;
const GLX_CONTEXT_ROBUST_ACCESS_BIT_ARB: i32 = 0x0004;
const GLX_CONTEXT_RESET_NOTIFICATION_STRATEGY_ARB: i32 = 0x8256;
const GLX_LOSE_CONTEXT_ON_RESET_ARB: i32 = 0x8252;

type BindTexImageFn = unsafe extern "C" fn(*mut xlib::Display, glx::GLXDrawable, i32, *const i32);
type ReleaseTexImageFn = unsafe extern "C" fn(*mut xlib::Display, glx::GLXDrawable, i32);
type SwapIntervalFn = unsafe extern "C" fn(*mut xlib::Display, glx::GLXDrawable, i32);
type CopySubBufferFn = unsafe extern "C" fn(*mut xlib::Display, glx::GLXDrawable, i32, i32, i32, i32);
type CreateContextAttribsFn = unsafe extern "C" fn(
    *mut xlib::Display,
    glx::GLXFBConfig,
    glx::GLXContext,
    xlib::Bool,
    *const i32,
) -> glx::GLXContext;

static X_ERROR_OCCURRED: AtomicBool = AtomicBool::new(false);
static X_ERROR_CODE: AtomicI32 = AtomicI32::new(0);

unsafe extern "C" fn x_error_handler(_display: *mut xlib::Display, event: *mut xlib::XErrorEvent) -> i32 {
    if event.is_null() {
        return 0;
    }
    let (code, request, minor) = unsafe { ((*event).error_code, (*event).request_code, (*event).minor_code) };
    X_ERROR_CODE.store(code as i32, Ordering::SeqCst);
    X_ERROR_OCCURRED.store(true, Ordering::SeqCst);
    match code {
        4 => debug!("GLX: BadPixmap (request {}, minor {})", request, minor),
        8 => debug!("GLX: BadMatch (request {}, minor {})", request, minor),
        _ => warn!("GLX: X error {} (request {}, minor {})", code, request, minor),
    }
    0
}

const VERTEX_SHADER: &str = r#"
    #version 330 core
    layout (location = 0) in vec2 aPos;
    layout (location = 1) in vec2 aTexCoord;

    uniform mat4 uMvp;

    out vec2 TexCoord;

    void main() {
        gl_Position = uMvp * vec4(aPos, 0.0, 1.0);
        TexCoord = aTexCoord;
    }
"#;

const FRAGMENT_SHADER: &str = r#"
    #version 330 core
    out vec4 FragColor;

    in vec2 TexCoord;

    uniform sampler2D uTexture;
    uniform float uOpacity;
    uniform float uBrightness;
    uniform float uSaturation;

    void main() {
        vec4 color = texture(uTexture, TexCoord);
        if (uSaturation != 1.0) {
            float gray = dot(color.rgb, vec3(0.2126, 0.7152, 0.0722));
            color.rgb = mix(vec3(gray), color.rgb, uSaturation);
        }
        color.rgb *= uBrightness;
        FragColor = color * uOpacity;
    }
"#;

#[derive(Debug, Clone, Copy)]
struct DepthConfig {
    fb_config: glx::GLXFBConfig,
    texture_format: i32,
    y_inverted: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Uniforms {
    mvp: i32,
    texture: i32,
    opacity: i32,
    brightness: i32,
    saturation: i32,
}

pub struct GlxDevice {
    glx: Glx,
    xlib: Xlib,
    display: *mut xlib::Display,
    screen_num: i32,
    context: glx::GLXContext,
    drawable: glx::GLXDrawable,
    glx_window: Option<glx::GLXWindow>,
    conn: Arc<RustConnection>,
    root: u32,
    /// Indexed by pixmap depth
    depth_configs: [Option<DepthConfig>; 33],
    bind_tex_image: Option<BindTexImageFn>,
    release_tex_image: Option<ReleaseTexImageFn>,
    copy_sub_buffer_fn: Option<CopySubBufferFn>,
    buffer_age: bool,
    x11_sync: bool,
    robust: bool,
    program: u32,
    vao: u32,
    vbo: u32,
    uniforms: Uniforms,
    size: Size,
}

fn init_error(reason: impl Into<String>) -> BackendError {
    BackendError::init("opengl", reason)
}

impl GlxDevice {
    /// Create a context rendering to `overlay`. `x11_sync` says whether the
    /// server supports SYNC fences.
    pub fn new(
        conn: Arc<RustConnection>,
        screen_num: usize,
        root: u32,
        overlay: u32,
        size: Size,
        vsync: bool,
        x11_sync: bool,
    ) -> Result<Self, BackendError> {
        let xlib = Xlib::open().map_err(|e| init_error(format!("failed to load libX11: {}", e)))?;
        let glx = Glx::open().map_err(|e| init_error(format!("failed to load libGL: {}", e)))?;

        let display_name = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".into());
        let display_cstr = CString::new(display_name).map_err(|e| init_error(e.to_string()))?;
        let display = unsafe { (xlib.XOpenDisplay)(display_cstr.as_ptr()) };
        if display.is_null() {
            return Err(init_error("failed to open X11 display"));
        }
        unsafe {
            (xlib.XSetErrorHandler)(Some(x_error_handler));
        }

        // Teardown of partial state happens in Drop
        let mut device = Self {
            glx,
            xlib,
            display,
            screen_num: screen_num as i32,
            context: ptr::null_mut(),
            drawable: overlay as glx::GLXDrawable,
            glx_window: None,
            conn,
            root,
            depth_configs: [None; 33],
            bind_tex_image: None,
            release_tex_image: None,
            copy_sub_buffer_fn: None,
            buffer_age: false,
            x11_sync,
            robust: false,
            program: 0,
            vao: 0,
            vbo: 0,
            uniforms: Uniforms::default(),
            size,
        };
        device.initialize(overlay, vsync)?;
        Ok(device)
    }

    fn initialize(&mut self, overlay: u32, vsync: bool) -> Result<(), BackendError> {
        let (mut major, mut minor) = (0, 0);
        unsafe {
            (self.glx.glXQueryVersion)(self.display, &mut major, &mut minor);
        }
        info!("GLX version {}.{}", major, minor);
        if major < 1 || (major == 1 && minor < 3) {
            return Err(init_error(format!("GLX {}.{} is too old", major, minor)));
        }

        let extensions = self.extensions();
        if !extensions.contains("GLX_EXT_texture_from_pixmap") {
            return Err(BackendError::MissingExtension("GLX_EXT_texture_from_pixmap"));
        }

        let config = self.choose_config(overlay)?;
        self.context = self.create_context(config, &extensions)?;
        self.make_drawable_current(config, overlay)?;

        gl::load_with(|symbol| match self.proc_address(symbol) {
            Some(f) => f as *const _,
            None => ptr::null(),
        });

        // SAFETY: signatures from GLX_EXT_texture_from_pixmap
        unsafe {
            self.bind_tex_image = self
                .proc_address("glXBindTexImageEXT")
                .map(|f| std::mem::transmute::<unsafe extern "C" fn(), BindTexImageFn>(f));
            self.release_tex_image = self
                .proc_address("glXReleaseTexImageEXT")
                .map(|f| std::mem::transmute::<unsafe extern "C" fn(), ReleaseTexImageFn>(f));
        }
        if self.bind_tex_image.is_none() || self.release_tex_image.is_none() {
            return Err(init_error("GLX_EXT_texture_from_pixmap functions missing"));
        }

        if extensions.contains("GLX_MESA_copy_sub_buffer") {
            // SAFETY: signature from GLX_MESA_copy_sub_buffer
            self.copy_sub_buffer_fn = self
                .proc_address("glXCopySubBufferMESA")
                .map(|f| unsafe { std::mem::transmute::<unsafe extern "C" fn(), CopySubBufferFn>(f) });
        }
        self.buffer_age = extensions.contains("GLX_EXT_buffer_age");
        self.set_swap_interval(overlay, vsync);

        self.initialize_depth_configs();
        if self.depth_configs[24].is_none() && self.depth_configs[32].is_none() {
            return Err(init_error("no FBConfig can bind 24 or 32 bit pixmaps"));
        }

        self.setup_program().map_err(init_error)?;
        unsafe {
            gl::Viewport(0, 0, self.size.width, self.size.height);
        }
        info!(
            "GLX device ready (buffer age {}, copy sub buffer {}, robust {})",
            self.buffer_age,
            self.copy_sub_buffer_fn.is_some(),
            self.robust
        );
        Ok(())
    }

    fn extensions(&self) -> String {
        unsafe {
            let s = (self.glx.glXQueryExtensionsString)(self.display, self.screen_num);
            if s.is_null() {
                String::new()
            } else {
                CStr::from_ptr(s).to_string_lossy().into_owned()
            }
        }
    }

    fn proc_address(&self, name: &str) -> Option<unsafe extern "C" fn()> {
        let name = CString::new(name).ok()?;
        unsafe { (self.glx.glXGetProcAddress)(name.as_ptr() as *const _) }
    }

    fn fb_attrib(&self, config: glx::GLXFBConfig, attrib: i32) -> i32 {
        let mut value = 0;
        unsafe {
            (self.glx.glXGetFBConfigAttrib)(self.display, config, attrib, &mut value);
        }
        value
    }

    fn visual_of(&self, config: glx::GLXFBConfig) -> Option<(xlib::VisualID, i32)> {
        unsafe {
            let vinfo = (self.glx.glXGetVisualFromFBConfig)(self.display, config);
            if vinfo.is_null() {
                return None;
            }
            let result = ((*vinfo).visualid, (*vinfo).depth);
            (self.xlib.XFree)(vinfo as *mut _);
            Some(result)
        }
    }

    fn choose_configs(&self, attribs: &[i32]) -> Vec<glx::GLXFBConfig> {
        let mut count = 0;
        unsafe {
            let configs = (self.glx.glXChooseFBConfig)(self.display, self.screen_num, attribs.as_ptr(), &mut count);
            if configs.is_null() {
                return Vec::new();
            }
            let list = std::slice::from_raw_parts(configs, count.max(0) as usize).to_vec();
            (self.xlib.XFree)(configs as *mut _);
            list
        }
    }

    /// The config whose visual matches the overlay, or any double buffered
    /// config otherwise
    fn choose_config(&self, overlay: u32) -> Result<glx::GLXFBConfig, BackendError> {
        let overlay_visual = unsafe {
            let mut attrs = std::mem::zeroed::<xlib::XWindowAttributes>();
            if (self.xlib.XGetWindowAttributes)(self.display, overlay as xlib::Window, &mut attrs) != 0
                && !attrs.visual.is_null()
            {
                (*attrs.visual).visualid
            } else {
                0
            }
        };

        let attribs = [
            glx::GLX_DRAWABLE_TYPE as i32,
            glx::GLX_WINDOW_BIT as i32,
            glx::GLX_RENDER_TYPE as i32,
            glx::GLX_RGBA_BIT as i32,
            glx::GLX_DOUBLEBUFFER as i32,
            1,
            glx::GLX_RED_SIZE as i32,
            8,
            glx::GLX_GREEN_SIZE as i32,
            8,
            glx::GLX_BLUE_SIZE as i32,
            8,
            0,
        ];
        let configs = self.choose_configs(&attribs);
        if let Some(config) = configs
            .iter()
            .copied()
            .find(|c| overlay_visual != 0 && self.visual_of(*c).map(|(id, _)| id) == Some(overlay_visual))
        {
            debug!("GLX: FBConfig matches overlay visual 0x{:x}", overlay_visual);
            return Ok(config);
        }
        let config = configs
            .first()
            .copied()
            .ok_or_else(|| init_error("no double buffered RGBA FBConfig"))?;
        warn!(
            "GLX: no FBConfig for overlay visual 0x{:x}, using a GLX window",
            overlay_visual
        );
        Ok(config)
    }

    fn create_context(&mut self, config: glx::GLXFBConfig, extensions: &str) -> Result<glx::GLXContext, BackendError> {
        if extensions.contains("GLX_ARB_create_context_robustness") {
            // SAFETY: signature from GLX_ARB_create_context
            let create = self
                .proc_address("glXCreateContextAttribsARB")
                .map(|f| unsafe { std::mem::transmute::<unsafe extern "C" fn(), CreateContextAttribsFn>(f) });
            if let Some(create) = create {
                let attribs = [
                    GLX_CONTEXT_FLAGS_ARB,
                    GLX_CONTEXT_ROBUST_ACCESS_BIT_ARB,
                    GLX_CONTEXT_RESET_NOTIFICATION_STRATEGY_ARB,
                    GLX_LOSE_CONTEXT_ON_RESET_ARB,
                    0,
                ];
                X_ERROR_OCCURRED.store(false, Ordering::SeqCst);
                let context = unsafe { create(self.display, config, ptr::null_mut(), 1, attribs.as_ptr()) };
                unsafe {
                    (self.xlib.XSync)(self.display, 0);
                }
                if !context.is_null() && !X_ERROR_OCCURRED.swap(false, Ordering::SeqCst) {
                    self.robust = true;
                    return Ok(context);
                }
                debug!("GLX: robust context creation failed, falling back");
            }
        }

        let context = unsafe {
            (self.glx.glXCreateNewContext)(self.display, config, glx::GLX_RGBA_TYPE as i32, ptr::null_mut(), 1)
        };
        if context.is_null() {
            return Err(init_error("glXCreateNewContext failed"));
        }
        Ok(context)
    }

    fn make_drawable_current(&mut self, config: glx::GLXFBConfig, overlay: u32) -> Result<(), BackendError> {
        let ok = unsafe { (self.glx.glXMakeCurrent)(self.display, overlay as glx::GLXDrawable, self.context) };
        unsafe {
            (self.xlib.XSync)(self.display, 0);
        }
        if ok != 0 {
            self.drawable = overlay as glx::GLXDrawable;
            return Ok(());
        }

        warn!("GLX: overlay window cannot be made current, creating a GLX window");
        let attribs = [0i32];
        let window = unsafe { (self.glx.glXCreateWindow)(self.display, config, overlay as xlib::Window, attribs.as_ptr()) };
        if window == 0 {
            return Err(init_error("glXCreateWindow failed"));
        }
        self.glx_window = Some(window);
        let ok = unsafe { (self.glx.glXMakeCurrent)(self.display, window, self.context) };
        if ok == 0 {
            return Err(init_error("glXMakeCurrent failed"));
        }
        self.drawable = window;
        Ok(())
    }

    fn set_swap_interval(&self, overlay: u32, vsync: bool) {
        let Some(swap_interval) = self.proc_address("glXSwapIntervalEXT") else {
            if vsync {
                warn!("glXSwapIntervalEXT not supported, vsync may be disabled");
            }
            return;
        };
        // SAFETY: signature from GLX_EXT_swap_control
        let swap_interval = unsafe { std::mem::transmute::<unsafe extern "C" fn(), SwapIntervalFn>(swap_interval) };
        unsafe {
            // Swap interval belongs to the window, not a GLX window wrapping it
            swap_interval(self.display, overlay as glx::GLXDrawable, i32::from(vsync));
            (self.xlib.XSync)(self.display, 0);
        }
    }

    /// Best pixmap-capable config per depth: no mipmaps needed, fewest
    /// buffers, smallest stencil and depth
    fn initialize_depth_configs(&mut self) {
        let attribs = [
            glx::GLX_DRAWABLE_TYPE as i32,
            glx::GLX_PIXMAP_BIT as i32,
            glx::GLX_RENDER_TYPE as i32,
            glx::GLX_RGBA_BIT as i32,
            0,
        ];
        let configs = self.choose_configs(&attribs);
        for depth in [24, 32] {
            let mut best: Option<(DepthConfig, (i32, i32, i32))> = None;
            for &config in &configs {
                let Some((_, visual_depth)) = self.visual_of(config) else {
                    continue;
                };
                if visual_depth != depth {
                    continue;
                }
                let buffer_size = self.fb_attrib(config, glx::GLX_BUFFER_SIZE as i32);
                let alpha_size = self.fb_attrib(config, glx::GLX_ALPHA_SIZE as i32);
                if buffer_size != depth && buffer_size - alpha_size != depth {
                    continue;
                }
                let texture_format = if depth == 32 {
                    if self.fb_attrib(config, GLX_BIND_TO_TEXTURE_RGBA_EXT) == 0 {
                        continue;
                    }
                    GLX_TEXTURE_FORMAT_RGBA_EXT
                } else {
                    if self.fb_attrib(config, GLX_BIND_TO_TEXTURE_RGB_EXT) == 0 {
                        continue;
                    }
                    GLX_TEXTURE_FORMAT_RGB_EXT
                };
                let score = (
                    self.fb_attrib(config, glx::GLX_DOUBLEBUFFER as i32),
                    self.fb_attrib(config, glx::GLX_STENCIL_SIZE as i32),
                    self.fb_attrib(config, glx::GLX_DEPTH_SIZE as i32),
                );
                if best.as_ref().is_some_and(|(_, s)| *s <= score) {
                    continue;
                }
                let candidate = DepthConfig {
                    fb_config: config,
                    texture_format,
                    y_inverted: self.fb_attrib(config, GLX_Y_INVERTED_EXT) != 0,
                };
                best = Some((candidate, score));
            }
            match best {
                Some((config, _)) => {
                    trace!("GLX: depth {} uses format 0x{:x}", depth, config.texture_format);
                    self.depth_configs[depth as usize] = Some(config);
                }
                None => debug!("GLX: no FBConfig binds depth {} pixmaps", depth),
            }
        }
    }

    fn setup_program(&mut self) -> Result<(), String> {
        unsafe {
            let vs = compile_shader(VERTEX_SHADER, gl::VERTEX_SHADER)?;
            let fs = compile_shader(FRAGMENT_SHADER, gl::FRAGMENT_SHADER)?;
            let program = link_program(vs, fs);
            gl::DeleteShader(vs);
            gl::DeleteShader(fs);
            self.program = program?;

            let location = |name: &[u8]| gl::GetUniformLocation(self.program, name.as_ptr() as *const _);
            self.uniforms = Uniforms {
                mvp: location(b"uMvp\0"),
                texture: location(b"uTexture\0"),
                opacity: location(b"uOpacity\0"),
                brightness: location(b"uBrightness\0"),
                saturation: location(b"uSaturation\0"),
            };

            gl::GenVertexArrays(1, &mut self.vao);
            gl::GenBuffers(1, &mut self.vbo);
            gl::BindVertexArray(self.vao);
            gl::BindBuffer(gl::ARRAY_BUFFER, self.vbo);
            let stride = 4 * std::mem::size_of::<f32>() as i32;
            gl::VertexAttribPointer(0, 2, gl::FLOAT, gl::FALSE, stride, ptr::null());
            gl::EnableVertexAttribArray(0);
            gl::VertexAttribPointer(1, 2, gl::FLOAT, gl::FALSE, stride, (2 * std::mem::size_of::<f32>()) as *const _);
            gl::EnableVertexAttribArray(1);
            gl::BindVertexArray(0);

            // Textures are premultiplied
            gl::BlendFunc(gl::ONE, gl::ONE_MINUS_SRC_ALPHA);
        }
        check_gl_error("program setup")
    }

    fn create_glx_pixmap(&self, pixmap: u32, depth: usize) -> Result<(glx::GLXPixmap, DepthConfig), String> {
        let config = self.depth_configs[depth].ok_or_else(|| format!("no FBConfig for depth {}", depth))?;
        let attribs = [
            GLX_TEXTURE_FORMAT_EXT,
            config.texture_format,
            GLX_TEXTURE_TARGET_EXT,
            GLX_TEXTURE_2D_EXT,
            GLX_MIPMAP_TEXTURE_EXT,
            0,
            0,
        ];
        unsafe {
            (self.xlib.XSync)(self.display, 0);
        }
        X_ERROR_OCCURRED.store(false, Ordering::SeqCst);
        let glx_pixmap = unsafe {
            (self.glx.glXCreatePixmap)(self.display, config.fb_config, pixmap as xlib::Pixmap, attribs.as_ptr())
        };
        unsafe {
            (self.xlib.XSync)(self.display, 0);
        }
        if X_ERROR_OCCURRED.swap(false, Ordering::SeqCst) {
            let code = X_ERROR_CODE.load(Ordering::SeqCst);
            if glx_pixmap != 0 {
                unsafe { (self.glx.glXDestroyPixmap)(self.display, glx_pixmap) };
            }
            return Err(format!("glXCreatePixmap for pixmap {} failed with X error {}", pixmap, code));
        }
        if glx_pixmap == 0 {
            return Err(format!("glXCreatePixmap for pixmap {} failed", pixmap));
        }
        Ok((glx_pixmap, config))
    }

    fn bind_tex_image(&self, texture: u32, glx_pixmap: glx::GLXPixmap) {
        let Some(bind) = self.bind_tex_image else {
            return;
        };
        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, texture);
            (self.glx.glXWaitX)();
            bind(self.display, glx_pixmap, GLX_FRONT_LEFT_EXT, ptr::null());
        }
    }

    fn release_tex_image(&self, texture: u32, glx_pixmap: glx::GLXPixmap) {
        let Some(release) = self.release_tex_image else {
            return;
        };
        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, texture);
            release(self.display, glx_pixmap, GLX_FRONT_LEFT_EXT);
        }
    }

    fn blit(&self, rects: &[Rect], read: gl::types::GLenum, draw: gl::types::GLenum) {
        unsafe {
            gl::ReadBuffer(read);
            gl::DrawBuffer(draw);
            for r in rects {
                gl::BlitFramebuffer(
                    r.x,
                    r.y,
                    r.right(),
                    r.bottom(),
                    r.x,
                    r.y,
                    r.right(),
                    r.bottom(),
                    gl::COLOR_BUFFER_BIT,
                    gl::NEAREST,
                );
            }
            gl::ReadBuffer(gl::BACK);
            gl::DrawBuffer(gl::BACK);
        }
    }
}

unsafe fn compile_shader(source: &str, shader_type: u32) -> Result<u32, String> {
    let c_str = CString::new(source).map_err(|e| e.to_string())?;
    unsafe {
        let shader = gl::CreateShader(shader_type);
        gl::ShaderSource(shader, 1, &c_str.as_ptr(), ptr::null());
        gl::CompileShader(shader);

        let mut success = 0;
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut success);
        if success == 0 {
            let mut len = 0;
            gl::GetShaderiv(shader, gl::INFO_LOG_LENGTH, &mut len);
            let mut buffer = vec![0u8; len.max(0) as usize];
            gl::GetShaderInfoLog(shader, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
            gl::DeleteShader(shader);
            return Err(format!("shader compilation failed: {}", String::from_utf8_lossy(&buffer)));
        }
        Ok(shader)
    }
}

unsafe fn link_program(vs: u32, fs: u32) -> Result<u32, String> {
    unsafe {
        let program = gl::CreateProgram();
        gl::AttachShader(program, vs);
        gl::AttachShader(program, fs);
        gl::LinkProgram(program);

        let mut success = 0;
        gl::GetProgramiv(program, gl::LINK_STATUS, &mut success);
        if success == 0 {
            let mut len = 0;
            gl::GetProgramiv(program, gl::INFO_LOG_LENGTH, &mut len);
            let mut buffer = vec![0u8; len.max(0) as usize];
            gl::GetProgramInfoLog(program, len, ptr::null_mut(), buffer.as_mut_ptr() as *mut _);
            gl::DeleteProgram(program);
            return Err(format!("program linking failed: {}", String::from_utf8_lossy(&buffer)));
        }
        Ok(program)
    }
}

fn check_gl_error(what: &str) -> Result<(), String> {
    let error = unsafe { gl::GetError() };
    if error != gl::NO_ERROR {
        return Err(format!("GL error 0x{:x} during {}", error, what));
    }
    Ok(())
}

fn upload_rect(image: &Image, rect: Rect) {
    unsafe {
        gl::PixelStorei(gl::UNPACK_ROW_LENGTH, image.width());
        gl::PixelStorei(gl::UNPACK_SKIP_PIXELS, rect.x);
        gl::PixelStorei(gl::UNPACK_SKIP_ROWS, rect.y);
        gl::TexSubImage2D(
            gl::TEXTURE_2D,
            0,
            rect.x,
            rect.y,
            rect.width,
            rect.height,
            gl::BGRA,
            gl::UNSIGNED_BYTE,
            image.as_bytes().as_ptr() as *const _,
        );
        gl::PixelStorei(gl::UNPACK_ROW_LENGTH, 0);
        gl::PixelStorei(gl::UNPACK_SKIP_PIXELS, 0);
        gl::PixelStorei(gl::UNPACK_SKIP_ROWS, 0);
    }
}

impl GlDevice for GlxDevice {
    fn make_current(&mut self) -> bool {
        unsafe { (self.glx.glXMakeCurrent)(self.display, self.drawable, self.context) != 0 }
    }

    fn supports_buffer_age(&self) -> bool {
        self.buffer_age
    }

    fn query_buffer_age(&mut self) -> i32 {
        let mut age = 0u32;
        unsafe {
            (self.glx.glXQueryDrawable)(self.display, self.drawable, GLX_BACK_BUFFER_AGE_EXT, &mut age);
        }
        age as i32
    }

    fn supports_copy_sub_buffer(&self) -> bool {
        self.copy_sub_buffer_fn.is_some()
    }

    fn swap_buffers(&mut self) {
        unsafe {
            (self.glx.glXSwapBuffers)(self.display, self.drawable);
        }
    }

    fn copy_sub_buffer(&mut self, rect: Rect) {
        if let Some(copy) = self.copy_sub_buffer_fn {
            unsafe { copy(self.display, self.drawable, rect.x, rect.y, rect.width, rect.height) };
        }
    }

    fn copy_back_to_front(&mut self, rects: &[Rect]) {
        self.blit(rects, gl::BACK, gl::FRONT);
    }

    fn copy_front_to_back(&mut self, rects: &[Rect]) {
        self.blit(rects, gl::FRONT, gl::BACK);
    }

    fn wait_x(&mut self) {
        unsafe { (self.glx.glXWaitX)() };
    }

    fn wait_gl(&mut self) {
        unsafe {
            (self.glx.glXWaitGL)();
            (self.xlib.XFlush)(self.display);
        }
    }

    fn flush(&mut self) {
        unsafe { gl::Flush() };
    }

    fn reset_status(&mut self) -> ResetStatus {
        if !self.robust || !gl::GetGraphicsResetStatus::is_loaded() {
            return ResetStatus::NoError;
        }
        match unsafe { gl::GetGraphicsResetStatus() } {
            gl::NO_ERROR => ResetStatus::NoError,
            gl::GUILTY_CONTEXT_RESET => ResetStatus::Guilty,
            gl::INNOCENT_CONTEXT_RESET => ResetStatus::Innocent,
            _ => ResetStatus::Unknown,
        }
    }

    fn clear(&mut self, rects: &[Rect]) {
        unsafe {
            gl::ClearColor(0.0, 0.0, 0.0, 1.0);
            gl::Enable(gl::SCISSOR_TEST);
            for r in rects {
                gl::Scissor(r.x, r.y, r.width, r.height);
                gl::Clear(gl::COLOR_BUFFER_BIT);
            }
            gl::Disable(gl::SCISSOR_TEST);
        }
    }

    fn set_scissor(&mut self, rect: Option<Rect>) {
        unsafe {
            match rect {
                Some(r) => {
                    gl::Enable(gl::SCISSOR_TEST);
                    gl::Scissor(r.x, r.y, r.width, r.height);
                }
                None => gl::Disable(gl::SCISSOR_TEST),
            }
        }
    }

    fn create_texture(&mut self, image: &Image) -> Result<u32, String> {
        let mut texture = 0;
        unsafe {
            gl::GenTextures(1, &mut texture);
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl::RGBA8 as i32,
                image.width(),
                image.height(),
                0,
                gl::BGRA,
                gl::UNSIGNED_BYTE,
                image.as_bytes().as_ptr() as *const _,
            );
        }
        if let Err(e) = check_gl_error("texture upload") {
            unsafe { gl::DeleteTextures(1, &texture) };
            return Err(e);
        }
        Ok(texture)
    }

    fn update_texture(&mut self, texture: u32, image: &Image, rect: Rect) -> Result<(), String> {
        let rect = rect.intersected(&image.rect());
        if rect.is_empty() {
            return Ok(());
        }
        unsafe { gl::BindTexture(gl::TEXTURE_2D, texture) };
        upload_rect(image, rect);
        check_gl_error("texture update")
    }

    fn bind_pixmap(&mut self, pixmap: u32, size: Size, has_alpha: bool) -> Result<PixmapBinding, String> {
        let depth = if has_alpha { 32 } else { 24 };
        let (glx_pixmap, config) = self.create_glx_pixmap(pixmap, depth)?;
        let mut texture = 0;
        unsafe {
            gl::GenTextures(1, &mut texture);
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
        }
        self.bind_tex_image(texture, glx_pixmap);
        trace!(
            "GLX: bound pixmap {} ({}x{}, depth {}) to texture {}",
            pixmap, size.width, size.height, depth, texture
        );
        Ok(PixmapBinding {
            texture,
            glx_pixmap,
            y_inverted: config.y_inverted,
        })
    }

    fn rebind_pixmap(&mut self, texture: u32, glx_pixmap: u64) {
        self.release_tex_image(texture, glx_pixmap);
        self.bind_tex_image(texture, glx_pixmap);
    }

    fn draw(&mut self, call: &DrawCall<'_>) {
        unsafe {
            if call.blend {
                gl::Enable(gl::BLEND);
            } else {
                gl::Disable(gl::BLEND);
            }
            gl::UseProgram(self.program);
            gl::UniformMatrix4fv(self.uniforms.mvp, 1, gl::FALSE, call.mvp.as_ptr());
            gl::Uniform1i(self.uniforms.texture, 0);
            gl::Uniform1f(self.uniforms.opacity, call.opacity);
            gl::Uniform1f(self.uniforms.brightness, call.brightness);
            gl::Uniform1f(self.uniforms.saturation, call.saturation);
            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(gl::TEXTURE_2D, call.texture);

            gl::BindVertexArray(self.vao);
            gl::BindBuffer(gl::ARRAY_BUFFER, self.vbo);
            gl::BufferData(
                gl::ARRAY_BUFFER,
                std::mem::size_of_val(call.vertices) as isize,
                call.vertices.as_ptr() as *const _,
                gl::STREAM_DRAW,
            );
            gl::DrawArrays(gl::TRIANGLES, 0, (call.vertices.len() / 4) as i32);
            gl::BindVertexArray(0);
        }
        if let Err(e) = check_gl_error("draw") {
            warn!("GLX: {}", e);
        }
    }

    fn release(&mut self, resource: GlResource) {
        match resource {
            GlResource::Texture(texture) => unsafe { gl::DeleteTextures(1, &texture) },
            GlResource::GlxPixmap(glx_pixmap) => {
                if let Some(release) = self.release_tex_image {
                    unsafe { release(self.display, glx_pixmap, GLX_FRONT_LEFT_EXT) };
                }
                unsafe { (self.glx.glXDestroyPixmap)(self.display, glx_pixmap) };
            }
        }
    }

    fn fence_ops(&mut self) -> Option<Box<dyn FenceOps>> {
        if !self.x11_sync {
            return None;
        }
        let ops = X11FenceOps::new(self.conn.clone(), self.root, |name| self.proc_address(name))?;
        Some(Box::new(ops))
    }

    fn resize(&mut self, size: Size) {
        self.size = size;
        unsafe { gl::Viewport(0, 0, size.width, size.height) };
    }
}

impl Drop for GlxDevice {
    fn drop(&mut self) {
        unsafe {
            if !self.context.is_null() {
                if self.program != 0 {
                    gl::DeleteBuffers(1, &self.vbo);
                    gl::DeleteVertexArrays(1, &self.vao);
                    gl::DeleteProgram(self.program);
                }
                (self.glx.glXMakeCurrent)(self.display, 0, ptr::null_mut());
                (self.glx.glXDestroyContext)(self.display, self.context);
            }
            if let Some(window) = self.glx_window {
                (self.glx.glXDestroyWindow)(self.display, window);
            }
            (self.xlib.XCloseDisplay)(self.display);
        }
        debug!("GLX device destroyed");
    }
}
