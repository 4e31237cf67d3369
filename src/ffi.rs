//! FFI bindings for wellness-sync
//!
//! This module provides C-compatible functions so the host app can run the
//! merge and validation rules without re-implementing them. Profiles cross
//! the boundary as the persisted layout: a JSON object of string entries.
//! All functions use C strings (null-terminated) and return allocated memory
//! that must be freed by the caller using `wellness_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use crate::error::SyncError;
use crate::prediction::StressPredictionRequest;
use crate::reconcile::{format_sleep_duration, merge_snapshot, EditGuard};
use crate::store::Entries;
use crate::types::{FetchSnapshot, ProfileField, UserProfile};

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Caller must free with `wellness_free_string`
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

fn parse_profile(json: &str) -> Result<UserProfile, SyncError> {
    let entries: Entries = serde_json::from_str(json)?;
    Ok(UserProfile::from_entries(&entries))
}

fn parse_guard(json: Option<String>) -> Result<EditGuard, SyncError> {
    match json {
        None => Ok(EditGuard::new()),
        Some(raw) => {
            let keys: Vec<String> = serde_json::from_str(&raw)?;
            let mut guard = EditGuard::new();
            for key in keys {
                let field: ProfileField = key.parse().map_err(|_| SyncError::UnknownField(key.clone()))?;
                guard.mark(field);
            }
            Ok(guard)
        }
    }
}

fn merge_json(profile: &str, snapshot: &str, guarded: Option<String>) -> Result<String, SyncError> {
    let profile = parse_profile(profile)?;
    let snapshot: FetchSnapshot = serde_json::from_str(snapshot)?;
    let guard = parse_guard(guarded)?;
    let merged = merge_snapshot(&profile, &snapshot, &guard);
    Ok(serde_json::to_string(&merged.to_entries())?)
}

fn prediction_json(profile: &str) -> Result<String, SyncError> {
    let profile = parse_profile(profile)?;
    let request = StressPredictionRequest::from_profile(&profile)?;
    Ok(serde_json::to_string(&request)?)
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Merge a fetch snapshot into a profile and return the merged profile JSON.
///
/// `guarded_fields` is an optional JSON array of field keys the user is
/// editing (e.g. `["daily_steps"]`); pass NULL when nothing is being edited.
///
/// # Safety
/// - `profile_json` and `snapshot_json` must be valid null-terminated C strings.
/// - `guarded_fields` must be NULL or a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `wellness_free_string`.
/// - Returns NULL on error; call `wellness_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn wellness_merge_snapshot(
    profile_json: *const c_char,
    snapshot_json: *const c_char,
    guarded_fields: *const c_char,
) -> *mut c_char {
    clear_last_error();

    let profile = match cstr_to_string(profile_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid profile string pointer");
            return ptr::null_mut();
        }
    };

    let snapshot = match cstr_to_string(snapshot_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid snapshot string pointer");
            return ptr::null_mut();
        }
    };

    match merge_json(&profile, &snapshot, cstr_to_string(guarded_fields)) {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

/// Format whole minutes of sleep the way the profile stores them.
///
/// # Safety
/// - Returns a newly allocated string that must be freed with `wellness_free_string`.
#[no_mangle]
pub unsafe extern "C" fn wellness_format_sleep_duration(total_minutes: i64) -> *mut c_char {
    clear_last_error();
    string_to_cstr(&format_sleep_duration(total_minutes.max(0)))
}

// ============================================================================
// Prediction
// ============================================================================

/// Validate a profile and return the prediction request body as JSON.
///
/// On failure the last error holds the user-visible validation message.
///
/// # Safety
/// - `profile_json` must be a valid null-terminated C string.
/// - Returns a newly allocated string that must be freed with `wellness_free_string`.
/// - Returns NULL on error; call `wellness_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn wellness_prediction_request(profile_json: *const c_char) -> *mut c_char {
    clear_last_error();

    let profile = match cstr_to_string(profile_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid profile string pointer");
            return ptr::null_mut();
        }
    };

    match prediction_json(&profile) {
        Ok(json) => string_to_cstr(&json),
        Err(e) if e.is_validation() => {
            set_last_error(&e.user_message());
            ptr::null_mut()
        }
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by a wellness function.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by a wellness function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn wellness_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next wellness function call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn wellness_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the library version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn wellness_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}
