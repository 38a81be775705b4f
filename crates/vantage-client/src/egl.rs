//! The EGL context as a scoped capability.
//!
//! Every GPU touch — swapchain creation, texture uploads from the decode
//! thread, the render pass, teardown — goes through [`EglContext::acquire`].
//! Acquisition is exclusive across threads and re-entrant within one, so the
//! render loop can nest scopes around XR calls that may touch GPU state.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use khronos_egl as egl;
use tracing::debug;

use vantage_common::{Error, Result};

/// Re-entrant mutual exclusion: one owning thread, counted depth.
#[derive(Default)]
pub struct ReentrantLock {
    state: Mutex<LockState>,
    unlocked: Condvar,
}

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

impl ReentrantLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> ReentrantGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock().expect("reentrant lock poisoned");
        while state.owner.is_some() && state.owner != Some(me) {
            state = self.unlocked.wait(state).expect("reentrant lock poisoned");
        }
        state.owner = Some(me);
        state.depth += 1;
        ReentrantGuard { lock: self }
    }

    fn unlock(&self) {
        let mut state = self.state.lock().expect("reentrant lock poisoned");
        debug_assert_eq!(state.owner, Some(thread::current().id()));
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.unlocked.notify_one();
        }
    }

    fn depth(&self) -> u32 {
        self.state.lock().expect("reentrant lock poisoned").depth
    }
}

pub struct ReentrantGuard<'a> {
    lock: &'a ReentrantLock,
}

impl ReentrantGuard<'_> {
    /// True when dropping this guard will release the lock entirely.
    pub fn is_outermost(&self) -> bool {
        self.lock.depth() == 1
    }
}

impl Drop for ReentrantGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Shared EGL context + GL function table, current only inside a guard.
pub struct EglContext {
    egl: egl::DynamicInstance<egl::EGL1_4>,
    display: egl::Display,
    config: egl::Config,
    context: egl::Context,
    surface: egl::Surface,
    gl: glow::Context,
    lock: ReentrantLock,
}

// The GL/EGL handles are only ever dereferenced while the context is current,
// which `acquire` serializes through the re-entrant lock.
unsafe impl Send for EglContext {}
unsafe impl Sync for EglContext {}

impl EglContext {
    /// Create a GLES3 context with a small pbuffer surface for off-screen
    /// work (the XR runtime owns the real surfaces).
    pub fn new() -> Result<Self> {
        let egl = unsafe { egl::DynamicInstance::<egl::EGL1_4>::load_required() }
            .map_err(|err| Error::gl(format!("EGL load failed: {err}")))?;

        let display = unsafe { egl.get_display(egl::DEFAULT_DISPLAY) }
            .ok_or_else(|| Error::gl("no default EGL display"))?;
        egl.initialize(display)
            .map_err(|err| Error::gl(format!("eglInitialize: {err}")))?;
        egl.bind_api(egl::OPENGL_ES_API)
            .map_err(|err| Error::gl(format!("eglBindAPI: {err}")))?;

        let config_attribs = [
            egl::RED_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
            egl::ALPHA_SIZE,
            8,
            egl::SURFACE_TYPE,
            egl::PBUFFER_BIT,
            egl::RENDERABLE_TYPE,
            egl::OPENGL_ES3_BIT,
            egl::NONE,
        ];
        let config = egl
            .choose_first_config(display, &config_attribs)
            .map_err(|err| Error::gl(format!("eglChooseConfig: {err}")))?
            .ok_or_else(|| Error::gl("no GLES3 pbuffer EGL config"))?;

        let context_attribs = [egl::CONTEXT_CLIENT_VERSION, 3, egl::NONE];
        let context = egl
            .create_context(display, config, None, &context_attribs)
            .map_err(|err| Error::gl(format!("eglCreateContext: {err}")))?;

        let surface_attribs = [egl::WIDTH, 16, egl::HEIGHT, 16, egl::NONE];
        let surface = egl
            .create_pbuffer_surface(display, config, &surface_attribs)
            .map_err(|err| Error::gl(format!("eglCreatePbufferSurface: {err}")))?;

        egl.make_current(display, Some(surface), Some(surface), Some(context))
            .map_err(|err| Error::gl(format!("eglMakeCurrent: {err}")))?;
        let gl = unsafe {
            glow::Context::from_loader_function(|name| match egl.get_proc_address(name) {
                Some(f) => f as *const std::ffi::c_void,
                None => std::ptr::null(),
            })
        };
        egl.make_current(display, None, None, None)
            .map_err(|err| Error::gl(format!("eglMakeCurrent(None): {err}")))?;

        debug!("EGL context ready");
        Ok(Self {
            egl,
            display,
            config,
            context,
            surface,
            gl,
            lock: ReentrantLock::new(),
        })
    }

    /// Make the context current on this thread for the guard's lifetime.
    pub fn acquire(&self) -> Result<EglGuard<'_>> {
        let guard = self.lock.lock();
        if guard.is_outermost() {
            self.egl
                .make_current(
                    self.display,
                    Some(self.surface),
                    Some(self.surface),
                    Some(self.context),
                )
                .map_err(|err| Error::gl(format!("eglMakeCurrent: {err}")))?;
        }
        Ok(EglGuard {
            ctx: self,
            guard,
        })
    }

    pub fn raw_display(&self) -> *mut std::ffi::c_void {
        self.display.as_ptr()
    }

    pub fn raw_config(&self) -> *mut std::ffi::c_void {
        self.config.as_ptr()
    }

    pub fn raw_context(&self) -> *mut std::ffi::c_void {
        self.context.as_ptr()
    }
}

/// Proof that the EGL context is current on this thread.
pub struct EglGuard<'a> {
    ctx: &'a EglContext,
    guard: ReentrantGuard<'a>,
}

impl EglGuard<'_> {
    pub fn gl(&self) -> &glow::Context {
        &self.ctx.gl
    }
}

impl Drop for EglGuard<'_> {
    fn drop(&mut self) {
        if self.guard.is_outermost() {
            let _ = self.ctx.egl.make_current(self.ctx.display, None, None, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn reentry_on_one_thread_does_not_deadlock() {
        let lock = ReentrantLock::new();
        let outer = lock.lock();
        assert!(outer.is_outermost());
        {
            let inner = lock.lock();
            assert!(!inner.is_outermost());
        }
        assert!(outer.is_outermost());
    }

    #[test]
    fn cross_thread_acquisition_is_exclusive() {
        let lock = Arc::new(ReentrantLock::new());
        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let _guard = lock.lock();
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
