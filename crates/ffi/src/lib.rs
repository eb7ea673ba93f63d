//! C bindings for text2image.
//!
//! Exposes one process-wide [`LibraryContext`] through `Text2Image_*`
//! functions declared in `include/text2image.h`.
//!
//! # Example
//!
//! ```c
//! #include "text2image.h"
//!
//! int main(void) {
//!     if (!Text2Image_Init()) return 1;
//!
//!     Text2Image_RenderOptions options = Text2Image_GetDefaultOptions();
//!     options.resolution = TEXT2IMAGE_RESOLUTION_1080P;
//!
//!     Text2Image_TaskHandle task =
//!         Text2Image_CreateTask("<p>Hello</p>", "p { color: red }", &options);
//!     if (!Text2Image_Render(task, "out.png")) {
//!         fprintf(stderr, "%s\n", Text2Image_GetLastError());
//!     }
//!
//!     Text2Image_FreeTask(task);
//!     Text2Image_Shutdown();
//!     return 0;
//! }
//! ```
//!
//! Handles are opaque non-null integers; a freed or stale handle is
//! rejected instead of dereferenced. Strings returned by the library are
//! thread-local copies that stay valid until the next call of the same
//! function on the same thread.

#![allow(non_snake_case)]

use std::alloc::{self, Layout};
use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::ptr;
use std::sync::LazyLock;
use std::thread::LocalKey;
use std::time::Duration;
use text2image_core::{
    BackgroundType, ContextConfig, ImageFormat, LibraryContext, RenderCallback, RenderOptions,
    Resolution, TaskHandle, Text2ImageError,
};
use tracing::error;

pub const TEXT2IMAGE_RESOLUTION_AUTO: c_int = 0;
pub const TEXT2IMAGE_RESOLUTION_720P: c_int = 1;
pub const TEXT2IMAGE_RESOLUTION_1080P: c_int = 2;
pub const TEXT2IMAGE_RESOLUTION_2K: c_int = 3;
pub const TEXT2IMAGE_RESOLUTION_4K: c_int = 4;
pub const TEXT2IMAGE_RESOLUTION_8K: c_int = 5;

pub const TEXT2IMAGE_FORMAT_PNG: c_int = 0;
pub const TEXT2IMAGE_FORMAT_JPG: c_int = 1;
pub const TEXT2IMAGE_FORMAT_JPEG: c_int = 1;
pub const TEXT2IMAGE_FORMAT_WEBP: c_int = 2;
pub const TEXT2IMAGE_FORMAT_BMP: c_int = 3;
pub const TEXT2IMAGE_FORMAT_TIF: c_int = 4;
pub const TEXT2IMAGE_FORMAT_TIFF: c_int = 4;
pub const TEXT2IMAGE_FORMAT_HEIC: c_int = 5;
pub const TEXT2IMAGE_FORMAT_HEIF: c_int = 5;
pub const TEXT2IMAGE_FORMAT_AVIF: c_int = 6;

pub const TEXT2IMAGE_BACKGROUND_SOLID: c_int = 0;
pub const TEXT2IMAGE_BACKGROUND_IMAGE: c_int = 1;

pub const TEXT2IMAGE_STATUS_UNKNOWN: c_int = -1;
pub const TEXT2IMAGE_STATUS_PENDING: c_int = 0;
pub const TEXT2IMAGE_STATUS_RUNNING: c_int = 1;
pub const TEXT2IMAGE_STATUS_COMPLETED: c_int = 2;
pub const TEXT2IMAGE_STATUS_FAILED: c_int = 3;
pub const TEXT2IMAGE_STATUS_CANCELLED: c_int = 4;

/// Opaque task reference. Never dereferenced.
pub type Text2ImageTaskHandle = *mut c_void;

/// Completion callback, invoked once on a worker thread.
pub type Text2ImageRenderCallback =
    Option<unsafe extern "C" fn(task: Text2ImageTaskHandle, success: bool, user_data: *mut c_void)>;

/// C layout of [`RenderOptions`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Text2ImageRenderOptions {
    pub resolution: c_int,
    pub format: c_int,
    /// 0-100.
    pub quality: c_int,
    pub custom_width: c_int,
    pub custom_height: c_int,
    pub background_type: c_int,
    /// ARGB.
    pub background_color: u32,
    /// NUL-terminated path, or null.
    pub background_image: *const c_char,
    pub background_blur: f32,
    pub border_radius: c_int,
    pub enable_javascript: bool,
    /// Milliseconds; 0 disables the limit.
    pub timeout: c_int,
}

impl Text2ImageRenderOptions {
    /// Convert to owned options, rejecting out-of-range values.
    ///
    /// # Safety
    ///
    /// `background_image` must be null or point to a NUL-terminated string.
    unsafe fn to_options(&self) -> Result<RenderOptions, Text2ImageError> {
        let background_image = match unsafe { opt_str(self.background_image, "background_image") }? {
            Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
            _ => None,
        };
        let options = RenderOptions {
            resolution: Resolution::try_from(self.resolution)?,
            format: ImageFormat::try_from(self.format)?,
            quality: non_negative(self.quality, "quality")?
                .try_into()
                .map_err(|_| invalid("quality must be between 0 and 100"))?,
            custom_width: non_negative(self.custom_width, "custom_width")?,
            custom_height: non_negative(self.custom_height, "custom_height")?,
            background_type: BackgroundType::try_from(self.background_type)?,
            background_color: self.background_color,
            background_image,
            background_blur: self.background_blur,
            border_radius: non_negative(self.border_radius, "border_radius")?,
            enable_javascript: self.enable_javascript,
            timeout: Duration::from_millis(u64::from(non_negative(self.timeout, "timeout")?)),
        };
        options.validate()?;
        Ok(options)
    }

    fn from_options(options: &RenderOptions) -> Self {
        let background_image = options
            .background_image
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned());
        Self {
            resolution: options.resolution as c_int,
            format: options.format as c_int,
            quality: c_int::from(options.quality),
            custom_width: saturate(options.custom_width),
            custom_height: saturate(options.custom_height),
            background_type: options.background_type as c_int,
            background_color: options.background_color,
            background_image: stash(&DEFAULT_IMAGE_COPY, background_image),
            background_blur: options.background_blur,
            border_radius: saturate(options.border_radius),
            enable_javascript: options.enable_javascript,
            timeout: c_int::try_from(options.timeout.as_millis()).unwrap_or(c_int::MAX),
        }
    }
}

static CONTEXT: LazyLock<LibraryContext> = LazyLock::new(LibraryContext::default);

thread_local! {
    static LAST_ERROR_COPY: RefCell<Option<CString>> = const { RefCell::new(None) };
    static TASK_ERROR_COPY: RefCell<Option<CString>> = const { RefCell::new(None) };
    static DEFAULT_IMAGE_COPY: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Bytes reserved in front of every result buffer for its length.
const BUFFER_HEADER: usize = std::mem::size_of::<usize>();

/// Keeps the callback's user pointer together so the closure is `Send`.
struct UserData(*mut c_void);

// SAFETY: the pointer is handed back to the caller's callback untouched;
// the caller is responsible for its thread safety.
unsafe impl Send for UserData {}

impl UserData {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

fn invalid(message: &str) -> Text2ImageError {
    Text2ImageError::InvalidArgument(message.to_string())
}

fn non_negative(value: c_int, field: &str) -> Result<u32, Text2ImageError> {
    u32::try_from(value).map_err(|_| invalid(&format!("{} must not be negative", field)))
}

fn saturate(value: u32) -> c_int {
    c_int::try_from(value).unwrap_or(c_int::MAX)
}

/// Borrow a C string. Null maps to `None`.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that outlives
/// the returned borrow.
unsafe fn opt_str<'a>(ptr: *const c_char, what: &str) -> Result<Option<&'a str>, Text2ImageError> {
    if ptr.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(Some)
        .map_err(|_| invalid(&format!("{} is not valid UTF-8", what)))
}

fn handle_from_ptr(task: Text2ImageTaskHandle) -> Result<TaskHandle, Text2ImageError> {
    if task.is_null() {
        return Err(invalid("task handle is null"));
    }
    TaskHandle::from_raw(task as usize).ok_or_else(|| invalid("malformed task handle"))
}

fn handle_to_ptr(handle: TaskHandle) -> Text2ImageTaskHandle {
    handle.into_raw() as Text2ImageTaskHandle
}

/// Store a thread-local copy of `message` and return a pointer to it.
fn stash(slot: &'static LocalKey<RefCell<Option<CString>>>, message: Option<String>) -> *const c_char {
    let copy = message.map(|message| {
        CString::new(message.replace('\0', " ")).unwrap_or_default()
    });
    slot.with(|cell| {
        let mut cell = cell.borrow_mut();
        *cell = copy;
        cell.as_ref().map_or(ptr::null(), |s| s.as_ptr())
    })
}

/// Record `err` and return `fallback`.
fn fail<T>(err: Text2ImageError, fallback: T) -> T {
    CONTEXT.set_last_error(&err);
    fallback
}

/// Run `body`, converting a panic into a recorded failure.
fn guard<T>(name: &str, fallback: T, body: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(_) => {
            error!("Panic in {}", name);
            fail(
                Text2ImageError::RenderFailure(format!("internal error in {}", name)),
                fallback,
            )
        }
    }
}

/// Copy `bytes` into a buffer releasable with [`Text2Image_FreeBuffer`].
fn alloc_buffer(bytes: &[u8]) -> Result<*mut u8, Text2ImageError> {
    let total = BUFFER_HEADER
        .checked_add(bytes.len())
        .ok_or(Text2ImageError::AllocationFailure { size: usize::MAX })?;
    let layout = Layout::from_size_align(total, std::mem::align_of::<usize>())
        .map_err(|_| Text2ImageError::AllocationFailure { size: total })?;

    // SAFETY: `layout` has a non-zero size (it includes the header).
    let base = unsafe { alloc::alloc(layout) };
    if base.is_null() {
        return Err(Text2ImageError::AllocationFailure { size: total });
    }
    // SAFETY: `base` is valid for `total` bytes and aligned for `usize`.
    unsafe {
        base.cast::<usize>().write(bytes.len());
        let data = base.add(BUFFER_HEADER);
        ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
        Ok(data)
    }
}

/// Release a buffer produced by [`alloc_buffer`].
///
/// # Safety
///
/// `data` must come from `alloc_buffer` and not have been freed.
unsafe fn free_buffer(data: *mut u8) {
    unsafe {
        let base = data.sub(BUFFER_HEADER);
        let len = base.cast::<usize>().read();
        let layout = Layout::from_size_align_unchecked(BUFFER_HEADER + len, std::mem::align_of::<usize>());
        alloc::dealloc(base, layout);
    }
}

/// Initialize the library with default settings.
///
/// Returns `true` if the library is ready, including when it already was.
#[no_mangle]
pub extern "C" fn Text2Image_Init() -> bool {
    guard("Text2Image_Init", false, || CONTEXT.initialize().is_ok())
}

/// Initialize the library from a JSON configuration document.
///
/// A null `json` behaves like [`Text2Image_Init`].
///
/// # Safety
///
/// `json` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn Text2Image_InitWithConfig(json: *const c_char) -> bool {
    guard("Text2Image_InitWithConfig", false, || {
        let json = match unsafe { opt_str(json, "config") } {
            Ok(Some(json)) => json,
            Ok(None) => return CONTEXT.initialize().is_ok(),
            Err(e) => return fail(e, false),
        };
        match ContextConfig::from_json(json) {
            Ok(config) => CONTEXT.initialize_with(config).is_ok(),
            Err(e) => fail(e, false),
        }
    })
}

/// Install a `RUST_LOG`-filtered log subscriber. Safe to call repeatedly.
#[no_mangle]
pub extern "C" fn Text2Image_InitLogging() {
    text2image_core::init_logging();
}

/// Drain pending work, release the engine and free every task.
#[no_mangle]
pub extern "C" fn Text2Image_Shutdown() {
    guard("Text2Image_Shutdown", (), || CONTEXT.shutdown());
}

/// Create a pending task. Returns null on failure.
///
/// A null `css` means no stylesheet; null `options` means the defaults.
///
/// # Safety
///
/// `html` and `css` must be null or NUL-terminated strings. `options` must
/// be null or point to a valid `Text2Image_RenderOptions`.
#[no_mangle]
pub unsafe extern "C" fn Text2Image_CreateTask(
    html: *const c_char,
    css: *const c_char,
    options: *const Text2ImageRenderOptions,
) -> Text2ImageTaskHandle {
    guard("Text2Image_CreateTask", ptr::null_mut(), || {
        let created = (|| {
            let html = unsafe { opt_str(html, "html") }?.ok_or_else(|| invalid("html is null"))?;
            let css = unsafe { opt_str(css, "css") }?.unwrap_or_default();
            let options = match unsafe { options.as_ref() } {
                Some(options) => Some(unsafe { options.to_options() }?),
                None => None,
            };
            Ok::<_, Text2ImageError>((html, css, options))
        })();
        match created {
            Ok((html, css, options)) => CONTEXT
                .create_task(html, css, options)
                .map_or(ptr::null_mut(), handle_to_ptr),
            Err(e) => fail(e, ptr::null_mut()),
        }
    })
}

/// Render on the calling thread. A null or empty `output_path` skips
/// saving.
///
/// # Safety
///
/// `output_path` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn Text2Image_Render(
    task: Text2ImageTaskHandle,
    output_path: *const c_char,
) -> bool {
    guard("Text2Image_Render", false, || {
        let handle = match handle_from_ptr(task) {
            Ok(handle) => handle,
            Err(e) => return fail(e, false),
        };
        let path = match unsafe { opt_str(output_path, "output_path") } {
            Ok(path) => path.map(PathBuf::from),
            Err(e) => return fail(e, false),
        };
        CONTEXT.render_sync(handle, path.as_deref()).is_ok()
    })
}

/// Queue the task on the worker pool and return immediately.
///
/// On `true`, `callback` (if any) runs exactly once on a worker thread. On
/// `false` it is never called.
///
/// # Safety
///
/// `output_path` must be null or a NUL-terminated string. `callback` must
/// be safe to call from another thread with `user_data`.
#[no_mangle]
pub unsafe extern "C" fn Text2Image_RenderAsync(
    task: Text2ImageTaskHandle,
    output_path: *const c_char,
    callback: Text2ImageRenderCallback,
    user_data: *mut c_void,
) -> bool {
    guard("Text2Image_RenderAsync", false, || {
        let handle = match handle_from_ptr(task) {
            Ok(handle) => handle,
            Err(e) => return fail(e, false),
        };
        let path = match unsafe { opt_str(output_path, "output_path") } {
            Ok(path) => path.filter(|p| !p.is_empty()).map(PathBuf::from),
            Err(e) => return fail(e, false),
        };

        let callback = callback.map(|callback| {
            let user_data = UserData(user_data);
            Box::new(move |handle: TaskHandle, success: bool| {
                // SAFETY: upheld by the caller of Text2Image_RenderAsync.
                unsafe { callback(handle_to_ptr(handle), success, user_data.get()) }
            }) as RenderCallback
        });

        CONTEXT.render_async(handle, path, callback).is_ok()
    })
}

/// Copy the encoded image of a completed task.
///
/// On success `*buffer` receives a copy owned by the caller, to be released
/// with [`Text2Image_FreeBuffer`], and `*size` its length.
///
/// # Safety
///
/// `buffer` and `size` must be valid for writes.
#[no_mangle]
pub unsafe extern "C" fn Text2Image_GetResult(
    task: Text2ImageTaskHandle,
    buffer: *mut *mut u8,
    size: *mut usize,
) -> bool {
    guard("Text2Image_GetResult", false, || {
        if buffer.is_null() || size.is_null() {
            return fail(invalid("buffer and size must not be null"), false);
        }
        let copied = handle_from_ptr(task)
            .and_then(|handle| CONTEXT.get_result(handle))
            .and_then(|bytes| alloc_buffer(&bytes).map(|data| (data, bytes.len())));
        match copied {
            Ok((data, len)) => {
                // SAFETY: both pointers checked non-null; validity is the
                // caller's contract.
                unsafe {
                    *buffer = data;
                    *size = len;
                }
                true
            }
            Err(e) => fail(e, false),
        }
    })
}

/// Release a buffer from [`Text2Image_GetResult`]. Null is ignored.
///
/// # Safety
///
/// `buffer` must be null or a pointer returned by `Text2Image_GetResult`
/// that has not been freed yet.
#[no_mangle]
pub unsafe extern "C" fn Text2Image_FreeBuffer(buffer: *mut u8) {
    if !buffer.is_null() {
        unsafe { free_buffer(buffer) };
    }
}

/// Free a task. Unknown, stale and null handles are ignored.
#[no_mangle]
pub extern "C" fn Text2Image_FreeTask(task: Text2ImageTaskHandle) {
    guard("Text2Image_FreeTask", (), || {
        if let Ok(handle) = handle_from_ptr(task) {
            CONTEXT.free_task(handle);
        }
    })
}

/// Cancel a task that has not started rendering.
#[no_mangle]
pub extern "C" fn Text2Image_CancelTask(task: Text2ImageTaskHandle) -> bool {
    guard("Text2Image_CancelTask", false, || {
        match handle_from_ptr(task) {
            Ok(handle) => CONTEXT.cancel_task(handle).is_ok(),
            Err(e) => fail(e, false),
        }
    })
}

/// Task status (0 pending, 1 running, 2 completed, 3 failed, 4 cancelled),
/// or -1 for an unknown handle.
#[no_mangle]
pub extern "C" fn Text2Image_GetTaskStatus(task: Text2ImageTaskHandle) -> c_int {
    guard("Text2Image_GetTaskStatus", TEXT2IMAGE_STATUS_UNKNOWN, || {
        handle_from_ptr(task)
            .and_then(|handle| CONTEXT.task_status(handle))
            .map_or(TEXT2IMAGE_STATUS_UNKNOWN, |status| status as c_int)
    })
}

/// Failure message of a failed task, or of a completed task whose output
/// file could not be written. Null when there is none.
#[no_mangle]
pub extern "C" fn Text2Image_GetTaskError(task: Text2ImageTaskHandle) -> *const c_char {
    guard("Text2Image_GetTaskError", ptr::null(), || {
        let message = handle_from_ptr(task).ok().and_then(|handle| {
            match CONTEXT.task_error(handle) {
                Ok(Some(message)) => Some(message),
                Ok(None) => CONTEXT.task_output_error(handle).ok().flatten(),
                Err(_) => None,
            }
        });
        stash(&TASK_ERROR_COPY, message)
    })
}

/// Most recent failure from any thread, or null.
#[no_mangle]
pub extern "C" fn Text2Image_GetLastError() -> *const c_char {
    guard("Text2Image_GetLastError", ptr::null(), || {
        stash(&LAST_ERROR_COPY, CONTEXT.last_error())
    })
}

/// Numeric code of the most recent failure, 0 if none.
#[no_mangle]
pub extern "C" fn Text2Image_GetLastErrorCode() -> c_int {
    guard("Text2Image_GetLastErrorCode", 0, || CONTEXT.last_error_code() as c_int)
}

/// Resize the worker pool. Zero or negative means one worker per core.
#[no_mangle]
pub extern "C" fn Text2Image_SetMaxThreads(num_threads: c_int) {
    guard("Text2Image_SetMaxThreads", (), || {
        let threads = usize::try_from(num_threads).unwrap_or(0);
        let _ = CONTEXT.set_max_threads(threads);
    })
}

/// Default render options.
///
/// `background_image` points to a thread-local copy, valid until the next
/// call on the same thread.
#[no_mangle]
pub extern "C" fn Text2Image_GetDefaultOptions() -> Text2ImageRenderOptions {
    guard(
        "Text2Image_GetDefaultOptions",
        Text2ImageRenderOptions::from_options(&RenderOptions::default()),
        || Text2ImageRenderOptions::from_options(&CONTEXT.default_options()),
    )
}
