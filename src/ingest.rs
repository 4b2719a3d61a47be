//! Ingesta de un directorio de proyecto en un `SourceBundle`: recorre los
//! ficheros, extrae texto (incluidos PDF), lo trocea por párrafos y etiqueta
//! cada fragmento con su tipo de señal.

use std::{fs, path::Path};

use mime_guess::MimeGuess;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::{
    error::{IntegrityViolation, PipelineError},
    models::{SignalKind, SourceBundle, SourceFragment},
    run_state::StatusHandle,
};

const MAX_FILE_BYTES: u64 = 500 * 1024;
const MAX_FILES: usize = 100;
const CHUNK_CHARS: usize = 1200;

const SKIP_FOLDERS: &[&str] = &[
    "node_modules", "__pycache__", ".git", ".svn", "venv", "env", ".env", "dist", "build",
    ".next", ".cache", "coverage", ".idea", ".vscode", "vendor", "target", "bin", "obj",
];

const CODE_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "tsx", "jsx", "java", "cpp", "c", "h", "cs", "go", "rs", "rb", "php",
    "swift", "kt", "scala", "r", "m", "mm", "sql", "sh", "bash", "ps1",
];
const DOC_EXTENSIONS: &[&str] = &["md", "txt", "rst", "pdf", "tex"];
const CONFIG_EXTENSIONS: &[&str] = &["json", "yaml", "yml", "toml", "ini", "cfg", "conf", "xml"];

/// Resumen de los resultados de una operación de ingesta.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestionSummary {
    pub files_scanned: u32,
    pub files_ingested: u32,
    pub files_skipped: u32,
    pub fragments_created: usize,
}

impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros escaneados, {} ingeridos, {} omitidos. {} fragmentos.",
            self.files_scanned, self.files_ingested, self.files_skipped, self.fragments_created
        )
    }
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIP_FOLDERS.contains(&name))
}

/// Recorre recursivamente `root` y construye el bundle. Un resultado sin
/// fragmentos es un error de integridad.
pub fn ingest_directory(
    root: &Path,
    status: &StatusHandle,
) -> Result<(SourceBundle, IngestionSummary), PipelineError> {
    if !root.is_dir() {
        return Err(PipelineError::Ingest(format!(
            "La ruta no es un directorio: {}",
            root.display()
        )));
    }

    let mut summary = IngestionSummary::default();
    let file_entries: Vec<DirEntry> = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_skipped_dir(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .collect();

    let total_files = file_entries.len().max(1) as f32;
    let mut fragments = Vec::new();

    for (index, entry) in file_entries.iter().enumerate() {
        if summary.files_ingested as usize >= MAX_FILES {
            debug!("Límite de {MAX_FILES} ficheros alcanzado");
            break;
        }
        summary.files_scanned += 1;
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);

        status.progress(
            format!("[{}/{}] Procesando: {}...", index + 1, file_entries.len(), relative.display()),
            (index + 1) as f32 / total_files,
        );

        match ingest_file(path, relative) {
            Ok(Some(file_fragments)) => {
                summary.files_ingested += 1;
                summary.fragments_created += file_fragments.len();
                fragments.extend(file_fragments);
            }
            Ok(None) => summary.files_skipped += 1,
            Err(err) => {
                summary.files_skipped += 1;
                warn!("Error leyendo {}: {err}", path.display());
            }
        }
    }

    info!("{summary}");
    if fragments.is_empty() {
        return Err(IntegrityViolation::EmptySourceBundle.into());
    }

    let name = root
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| root.display().to_string());
    Ok((SourceBundle::new(name, fragments), summary))
}

fn ingest_file(path: &Path, relative: &Path) -> std::io::Result<Option<Vec<SourceFragment>>> {
    let metadata = fs::metadata(path)?;
    if metadata.len() > MAX_FILE_BYTES {
        info!("Saltando fichero demasiado grande ({} bytes): {}", metadata.len(), path.display());
        return Ok(None);
    }

    let extension = path
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("")
        .to_lowercase();
    let mime = MimeGuess::from_path(path).first();
    let known = CODE_EXTENSIONS.contains(&extension.as_str())
        || DOC_EXTENSIONS.contains(&extension.as_str())
        || CONFIG_EXTENSIONS.contains(&extension.as_str());
    let textual_mime = mime.as_ref().is_some_and(|m| m.type_() == mime_guess::mime::TEXT);

    let text = match extension.as_str() {
        "pdf" => match pdf_extract::extract_text(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("No se pudo extraer texto del PDF {}: {}. Saltando fichero.", path.display(), e);
                return Ok(None);
            }
        },
        _ if known || textual_mime => match fs::read_to_string(path) {
            Ok(content) => content,
            Err(_) => {
                warn!("Saltando fichero no-texto o no-UTF8: {}", path.display());
                return Ok(None);
            }
        },
        _ => {
            debug!("Saltando fichero con extensión no soportada ('.{}'): {}", extension, path.display());
            return Ok(None);
        }
    };

    let chunks = split_into_chunks(&text, CHUNK_CHARS);
    if chunks.is_empty() {
        warn!("Fichero vacío o sin texto útil: {}", path.display());
        return Ok(None);
    }

    let path_str = relative.to_string_lossy().replace('\\', "/");
    let language = detect_language(&extension);
    Ok(Some(
        chunks
            .into_iter()
            .map(|excerpt| SourceFragment {
                signal: classify_signal(&path_str, &extension, &excerpt),
                path: path_str.clone(),
                excerpt,
                language: language.map(str::to_string),
            })
            .collect(),
    ))
}

/// Etiqueta heurística del fragmento según ruta, extensión y contenido.
fn classify_signal(path: &str, extension: &str, excerpt: &str) -> SignalKind {
    let path = path.to_lowercase();
    let text = excerpt.to_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|w| text.contains(w));

    if path.contains("bench") || mentions(&["benchmark", "latency", "throughput", "ops/sec"]) {
        return SignalKind::Benchmark;
    }
    if CONFIG_EXTENSIONS.contains(&extension) {
        return SignalKind::Configuration;
    }
    if DOC_EXTENSIONS.contains(&extension) {
        return if mentions(&["architecture", "component", "design", "diagram", "module"]) {
            SignalKind::Architecture
        } else {
            SignalKind::Documentation
        };
    }
    if ["api", "interface", "route", "handler", "endpoint"]
        .iter()
        .any(|w| path.contains(w))
        || mentions(&["pub trait", "interface ", "endpoint", "@app.route"])
    {
        return SignalKind::Interface;
    }
    if mentions(&["algorithm", "heuristic", "compute", "optimiz", "score", "sort"]) {
        return SignalKind::Algorithm;
    }
    SignalKind::Code
}

fn detect_language(extension: &str) -> Option<&'static str> {
    let language = match extension {
        "py" => "Python",
        "js" => "JavaScript",
        "ts" => "TypeScript",
        "tsx" => "TypeScript/React",
        "jsx" => "JavaScript/React",
        "java" => "Java",
        "cpp" => "C++",
        "c" => "C",
        "h" => "C/C++ Header",
        "cs" => "C#",
        "go" => "Go",
        "rs" => "Rust",
        "rb" => "Ruby",
        "php" => "PHP",
        "swift" => "Swift",
        "kt" => "Kotlin",
        "scala" => "Scala",
        "r" => "R",
        "sql" => "SQL",
        "sh" => "Shell",
        "bash" => "Bash",
        "ps1" => "PowerShell",
        "md" => "Markdown",
        "json" => "JSON",
        "yaml" | "yml" => "YAML",
        "xml" => "XML",
        "toml" => "TOML",
        _ => return None,
    };
    Some(language)
}

fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if current.len() + paragraph.len() + 2 > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_respect_paragraph_boundaries() {
        let text = format!("{}\n\n{}\n\n\n\nfin", "a".repeat(700), "b".repeat(700));
        let chunks = split_into_chunks(&text, 1200);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].ends_with("fin"));
    }

    #[test]
    fn signals_follow_path_and_content() {
        assert_eq!(classify_signal("benches/run.rs", "rs", "fn main() {}"), SignalKind::Benchmark);
        assert_eq!(classify_signal("Cargo.toml", "toml", "[package]"), SignalKind::Configuration);
        assert_eq!(
            classify_signal("README.md", "md", "The architecture has three components."),
            SignalKind::Architecture
        );
        assert_eq!(classify_signal("src/api/routes.rs", "rs", "fn get()"), SignalKind::Interface);
        assert_eq!(classify_signal("src/lib.rs", "rs", "fn main() {}"), SignalKind::Code);
    }

    #[test]
    fn walks_project_and_skips_vendor_folders() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("README.md"), "A sensor fusion design.\n\nSecond paragraph.").unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() { println!(\"hola\"); }").unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), "module.exports = 1;").unwrap();
        fs::write(dir.path().join("logo.png"), [0u8, 1, 2]).unwrap();

        let (bundle, summary) = ingest_directory(dir.path(), &StatusHandle::default()).unwrap();
        let paths: Vec<&str> = bundle.fragments().iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src/main.rs"]);
        assert_eq!(summary.files_ingested, 2);
        assert_eq!(summary.files_skipped, 1);
        assert_eq!(bundle.fragments()[1].language.as_deref(), Some("Rust"));
    }

    #[test]
    fn empty_project_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ingest_directory(dir.path(), &StatusHandle::default()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Integrity(IntegrityViolation::EmptySourceBundle)
        ));
    }
}
