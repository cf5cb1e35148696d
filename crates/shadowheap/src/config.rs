//! Runtime configuration from the environment.
//!
//! Read once during single-threaded init, before any shadowing happens.
//! `std::env` is off-limits here (it allocates through the allocator we are
//! in the middle of wrapping), so values come straight from `libc::getenv`
//! and the raw `environ` array.
//!
//! A check category can only be *disabled* here; categories compiled out of
//! the build stay off regardless of the environment.

use crate::diag::startup_error;
use core::ffi::c_char;

extern "C" {
    static environ: *const *const c_char;
}

/// Which shadow checks run, after compile-time gates and env overrides.
#[derive(Clone, Copy, Debug)]
pub struct Modes {
    pub ptr: bool,
    pub usb: bool,
    pub top: bool,
    pub tca: bool,
    pub leak: bool,
    /// Initial capacity hint for the metadata store; 0 means default.
    pub initial_store_size: usize,
}

impl Modes {
    pub const fn compiled_in() -> Modes {
        Modes {
            ptr: cfg!(feature = "ptr-checks"),
            usb: cfg!(feature = "usb-checks"),
            top: cfg!(feature = "top-checks"),
            tca: cfg!(feature = "tcache-checks"),
            leak: cfg!(feature = "leak-checks"),
            initial_store_size: 0,
        }
    }

    /// True when no check category is active at all; the facade then runs
    /// as a plain passthrough.
    pub fn all_disabled(&self) -> bool {
        !(self.ptr || self.usb || self.top || self.tca)
    }
}

/// Variables this library understands, as `NAME=` prefixes of environ
/// entries.
const KNOWN_VARS: &[&[u8]] = &[
    b"SHADOWHEAP_DISABLE_PTRCHECKS=",
    b"SHADOWHEAP_DISABLE_USBCHECKS=",
    b"SHADOWHEAP_DISABLE_TOPCHECKS=",
    b"SHADOWHEAP_DISABLE_TCACHECKS=",
    b"SHADOWHEAP_DISABLE_LEAKCHECKS=",
    b"SHADOWHEAP_SIZE_INITIAL=",
];

const PREFIX: &[u8] = b"SHADOWHEAP_";

/// Parse a boolean env value. `None` for absent/empty, `Ok(Some(..))` for
/// exactly "0" or "1", `Err` otherwise.
fn parse_bool(value: &[u8]) -> Result<Option<bool>, &'static str> {
    match value {
        b"" => Ok(None),
        b"1" => Ok(Some(true)),
        b"0" => Ok(Some(false)),
        _ => Err("value must be '1' or '0'"),
    }
}

/// Parse an unsigned env value, decimal or 0x-prefixed hex.
fn parse_usize(value: &[u8]) -> Result<Option<usize>, &'static str> {
    if value.is_empty() {
        return Ok(None);
    }
    let (digits, radix) = match value {
        [b'0', b'x', rest @ ..] | [b'0', b'X', rest @ ..] => (rest, 16),
        _ => (value, 10),
    };
    if digits.is_empty() {
        return Err("contains non-numeric chars");
    }
    let mut result: usize = 0;
    for &b in digits {
        let digit = match b {
            b'0'..=b'9' => (b - b'0') as usize,
            b'a'..=b'f' if radix == 16 => (b - b'a' + 10) as usize,
            b'A'..=b'F' if radix == 16 => (b - b'A' + 10) as usize,
            _ => return Err("contains non-numeric chars"),
        };
        result = result
            .checked_mul(radix)
            .and_then(|r| r.checked_add(digit))
            .ok_or("value out of range")?;
    }
    Ok(Some(result))
}

/// Fetch an env value as a byte slice. Empty slice when unset.
///
/// # Safety
/// Single-threaded init only; `getenv` results are invalidated by any later
/// `setenv`.
unsafe fn getenv_bytes(name: &core::ffi::CStr) -> &'static [u8] {
    let val = libc::getenv(name.as_ptr());
    if val.is_null() {
        return &[];
    }
    core::ffi::CStr::from_ptr(val).to_bytes()
}

unsafe fn disable_via_env(name: &core::ffi::CStr) -> bool {
    match parse_bool(getenv_bytes(name)) {
        Ok(flag) => flag.unwrap_or(false),
        Err(problem) => startup_error(format_args!(
            "shadowheap: ERROR: variable {}: {}",
            name.to_str().unwrap_or("?"),
            problem
        )),
    }
}

fn entry_is_known(entry: &[u8]) -> bool {
    if !entry.starts_with(PREFIX) {
        return true;
    }
    KNOWN_VARS.iter().any(|known| entry.starts_with(known))
}

/// Reject any `SHADOWHEAP_*` variable this build does not understand --
/// a typo in a disable switch must not silently leave a check armed.
///
/// # Safety
/// Single-threaded init only.
unsafe fn scan_environ() {
    let mut envp = environ;
    if envp.is_null() {
        return;
    }
    while !(*envp).is_null() {
        let entry = core::ffi::CStr::from_ptr(*envp).to_bytes();
        if !entry_is_known(entry) {
            startup_error(format_args!(
                "shadowheap: ERROR: unrecognized environment variable: {}",
                core::str::from_utf8(entry).unwrap_or("<non-utf8>")
            ));
        }
        envp = envp.add(1);
    }
}

/// Read the effective mode set. Fatal on malformed or unrecognized
/// `SHADOWHEAP_*` variables.
///
/// # Safety
/// Must run during single-threaded init.
pub unsafe fn read_modes() -> Modes {
    let mut modes = Modes::compiled_in();

    if modes.ptr && disable_via_env(c"SHADOWHEAP_DISABLE_PTRCHECKS") {
        modes.ptr = false;
    }
    if modes.usb && disable_via_env(c"SHADOWHEAP_DISABLE_USBCHECKS") {
        modes.usb = false;
    }
    if modes.top && disable_via_env(c"SHADOWHEAP_DISABLE_TOPCHECKS") {
        modes.top = false;
    }
    if modes.tca && disable_via_env(c"SHADOWHEAP_DISABLE_TCACHECKS") {
        modes.tca = false;
    }
    if modes.leak && disable_via_env(c"SHADOWHEAP_DISABLE_LEAKCHECKS") {
        modes.leak = false;
    }

    match parse_usize(getenv_bytes(c"SHADOWHEAP_SIZE_INITIAL")) {
        Ok(Some(n)) => modes.initial_store_size = n,
        Ok(None) => {}
        Err(problem) => startup_error(format_args!(
            "shadowheap: ERROR: variable SHADOWHEAP_SIZE_INITIAL: {}",
            problem
        )),
    }

    scan_environ();
    modes
}
