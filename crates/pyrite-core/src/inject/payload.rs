//! Source text for the in-target side of an injection.
//!
//! The caller's text never appears literally in the executed script: it is
//! hex-encoded and decoded by the wrapper, so quoting and newlines in the
//! caller's text can't break out of it.

use std::fmt::Write as _;

use crate::layout::BuildSignature;

/// Name of the `__main__` global the wrapper leaves its result in
pub const RESULT_NAME: &str = "__pyrite_result__";

/// File name compiled code reports when the caller doesn't give one
pub const DEFAULT_FILENAME: &str = "<pyrite-inject>";

const RUNNER_PY3: &str = "\
def __pyrite_run__(src, filename):
    import io, sys, traceback
    out = io.StringIO()
    saved = sys.stdout
    sys.stdout = out
    ok, tb = True, ''
    try:
        exec(compile(src, filename, 'exec'), globals())
    except BaseException:
        ok, tb = False, traceback.format_exc()
    finally:
        sys.stdout = saved
    globals()['__pyrite_result__'] = (ok, out.getvalue(), tb)
";

const RUNNER_PY2: &str = "\
def __pyrite_run__(src, filename):
    import StringIO, sys, traceback
    out = StringIO.StringIO()
    saved = sys.stdout
    sys.stdout = out
    ok, tb = True, ''
    try:
        exec compile(src, filename, 'exec') in globals()
    except BaseException:
        ok, tb = False, traceback.format_exc()
    finally:
        sys.stdout = saved
    globals()['__pyrite_result__'] = (ok, out.getvalue(), tb)
";

/// The two scripts one injection runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload
{
    /// Defines and calls the wrapper, which runs the caller's text
    pub script: String,
    /// Removes the result global once it has been read
    pub cleanup: String,
}

/// Build the scripts for `source`, compiled as if read from `filename`
pub fn build(build: BuildSignature, source: &str, filename: &str) -> Payload
{
    let source = hex_encode(source.as_bytes());
    let filename = hex_encode(filename.as_bytes());

    let script = if build.is_python2() {
        format!(
            "{RUNNER_PY2}__pyrite_run__('{source}'.decode('hex').decode('utf-8'), '{filename}'.decode('hex'))\n\
             del __pyrite_run__\n"
        )
    } else {
        format!(
            "{RUNNER_PY3}__pyrite_run__(bytes.fromhex('{source}').decode('utf-8'), \
             bytes.fromhex('{filename}').decode('utf-8'))\n\
             del __pyrite_run__\n"
        )
    };

    Payload {
        script,
        cleanup: format!("globals().pop('{RESULT_NAME}', None)\n"),
    }
}

/// Lowercase hex digits of `data`
pub fn hex_encode(data: &[u8]) -> String
{
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
