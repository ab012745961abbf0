//! runtime — locating native pieces the pipeline needs at startup:
//! the ONNX Runtime shared library and a label font.

use std::path::{Path, PathBuf};

#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(target_os = "windows")]
const ORT_LIB_NAME: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";

/// Label fonts tried, in order, when none is configured.
const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Resolve and set ORT_DYLIB_PATH at runtime when it is missing or invalid.
///
/// Priority order:
/// 1) Existing ORT_DYLIB_PATH (if file exists)
/// 2) models/onnxruntime*/lib/<lib> near current exe/cwd
/// 3) common system library directories
pub fn configure_ort_dylib() {
    if let Some(existing) = std::env::var_os("ORT_DYLIB_PATH") {
        let existing_path = PathBuf::from(existing);
        if existing_path.is_file() {
            tracing::info!(
                path = %existing_path.display(),
                "using ORT_DYLIB_PATH from environment"
            );
            return;
        }
        tracing::warn!(
            path = %existing_path.display(),
            "ORT_DYLIB_PATH is set but file does not exist; attempting auto-discovery"
        );
    }

    let found = search_roots()
        .iter()
        .flat_map(|root| ort_candidates(root))
        .chain(system_ort_candidates())
        .find(|candidate| candidate.is_file());

    match found {
        Some(candidate) => {
            // SAFETY: this is called before any ORT sessions are created and
            // from the main thread, so no concurrent env mutation.
            unsafe {
                std::env::set_var("ORT_DYLIB_PATH", &candidate);
            }
            tracing::info!(path = %candidate.display(), "configured ORT_DYLIB_PATH");
        }
        None => tracing::warn!(
            lib = ORT_LIB_NAME,
            "could not locate the ONNX Runtime library; set ORT_DYLIB_PATH"
        ),
    }
}

/// First existing label font: `configured` when given, otherwise a
/// `fonts/` directory near the executable or a well-known system font.
pub fn find_font(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "configured font not found; searching defaults");
    }

    search_roots()
        .iter()
        .flat_map(|root| {
            [
                root.join("fonts/DejaVuSans.ttf"),
                root.join("assets/DejaVuSans.ttf"),
            ]
        })
        .chain(FONT_CANDIDATES.iter().map(PathBuf::from))
        .find(|candidate| candidate.is_file())
}

/// The working directory plus the executable's directory and a few of its
/// ancestors (covers `target/{debug,release}` layouts).
fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }

    if let Ok(exe) = std::env::current_exe() {
        let mut dir = exe.parent().map(Path::to_path_buf);
        for _ in 0..4 {
            let Some(d) = dir else {
                break;
            };
            roots.push(d.clone());
            dir = d.parent().map(Path::to_path_buf);
        }
    }

    roots
}

fn ort_candidates(root: &Path) -> Vec<PathBuf> {
    vec![
        root.join("models/onnxruntime/lib").join(ORT_LIB_NAME),
        root.join("onnxruntime/lib").join(ORT_LIB_NAME),
        root.join("models").join(ORT_LIB_NAME),
        root.join(ORT_LIB_NAME),
    ]
}

fn system_ort_candidates() -> Vec<PathBuf> {
    ["/usr/local/lib", "/usr/lib", "/opt/homebrew/lib"]
        .iter()
        .map(|dir| Path::new(dir).join(ORT_LIB_NAME))
        .collect()
}
