//! Program loader: `.rllm` source files into validated [`ProgramDefinition`]s.
//!
//! A source file is a YAML header between `---` lines, followed by the
//! instruction body. The body may carry a recovery instruction after a
//! `<<<RECOVERY>>>` line and fenced `rllm-js pre` / `rllm-js post` transform
//! blocks. Loading only reads files; loaded programs are cached per canonical
//! path until [`ProgramCache::refresh`] drops them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::core::schema::check_schema;
use crate::core::version::{Qualifier, RuntimeCompat, Version};
use crate::error::{ErrorCode, ErrorPayload, RunError, RunResult};

pub const REQUIRED_FIELDS: [&str; 9] = [
    "author",
    "description",
    "input_schema",
    "llm",
    "llm_params",
    "max_context_window",
    "name",
    "output_schema",
    "version",
];

pub const ALLOWED_LLM_PARAMS: [&str; 17] = [
    "frequency_penalty",
    "format",
    "logit_bias",
    "max_tokens",
    "n",
    "parallel_tool_calls",
    "presence_penalty",
    "response_format",
    "seed",
    "stop",
    "stream",
    "temperature",
    "timeout",
    "tool_choice",
    "tools",
    "top_p",
    "user",
];

const RECOVERY_MARKER: &str = "\n<<<RECOVERY>>>\n";
const BLOCK_FENCE: &str = "```rllm-js";

/// Model identifier plus the allow-listed invocation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationTarget {
    pub model: String,
    pub params: Map<String, Value>,
}

/// How one child input field is produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Passed through with its declared type.
    Literal(Value),
    /// Rendered against `{input, uses}`; always yields a string.
    Template(String),
}

impl Binding {
    fn from_value(value: Value) -> Self {
        match value {
            Value::String(template) => Binding::Template(template),
            other => Binding::Literal(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DependencySpec {
    pub name: String,
    /// Child path resolved against the declaring file's directory.
    pub path: PathBuf,
    pub with: BTreeMap<String, Binding>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramDefinition {
    pub path: PathBuf,
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: String,
    pub max_context_window: u64,
    pub input_schema: Value,
    pub output_schema: Value,
    pub target: InvocationTarget,
    pub instruction: String,
    pub recovery: Option<String>,
    pub uses: Vec<DependencySpec>,
    pub pre_block: Option<String>,
    pub post_block: Option<String>,
    pub compat: Option<RuntimeCompat>,
    pub recommended_models: Vec<String>,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// Version of the running engine, used for `runllm_compat` checks.
pub fn runtime_version() -> Version {
    env!("CARGO_PKG_VERSION").parse().unwrap_or(Version {
        release: [0, 0, 0],
        qualifier: Qualifier::Release,
    })
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub runtime_version: Version,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            runtime_version: runtime_version(),
        }
    }
}

/// Per-session cache of loaded programs keyed by canonical path.
#[derive(Debug, Default)]
pub struct ProgramCache {
    options: LoaderOptions,
    programs: Mutex<HashMap<PathBuf, Arc<ProgramDefinition>>>,
}

impl ProgramCache {
    pub fn new(options: LoaderOptions) -> Self {
        Self {
            options,
            programs: Mutex::new(HashMap::new()),
        }
    }

    /// Load `path`, reusing a cached definition when present.
    pub fn load(&self, path: &Path) -> RunResult<Arc<ProgramDefinition>> {
        let canonical = canonical_source(path)?;
        if let Some(program) = self.lock().get(&canonical) {
            return Ok(Arc::clone(program));
        }
        let program = Arc::new(load_program(&canonical, &self.options)?);
        self.lock()
            .entry(canonical)
            .or_insert_with(|| Arc::clone(&program));
        Ok(program)
    }

    /// Drop one cached program, or every program when `path` is `None`.
    pub fn refresh(&self, path: Option<&Path>) {
        let mut programs = self.lock();
        match path {
            Some(path) => {
                let key = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
                programs.remove(&key);
            }
            None => programs.clear(),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<ProgramDefinition>>> {
        // The map holds no invariants a panicking holder could break.
        self.programs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn canonical_source(path: &Path) -> RunResult<PathBuf> {
    fs::canonicalize(path).map_err(|err| {
        ErrorPayload::new(ErrorCode::MalformedSource, "program file does not exist")
            .with_detail("path", path.display().to_string())
            .with_detail("reason", err.to_string())
            .with_hint("Pass an existing .rllm file path.")
            .into()
    })
}

/// Read and parse one program file.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_program(path: &Path, options: &LoaderOptions) -> RunResult<ProgramDefinition> {
    let source = fs::read_to_string(path).map_err(|err| {
        RunError::from(
            ErrorPayload::new(ErrorCode::MalformedSource, "could not read program file")
                .with_detail("path", path.display().to_string())
                .with_detail("reason", err.to_string()),
        )
    })?;
    let program = parse_program(path, &source, options)?;
    debug!(name = %program.name, uses = program.uses.len(), "program loaded");
    Ok(program)
}

/// Parse program source. `path` anchors relative `uses` paths.
pub fn parse_program(
    path: &Path,
    source: &str,
    options: &LoaderOptions,
) -> RunResult<ProgramDefinition> {
    let normalized = source.replace("\r\n", "\n");
    let (header, body) = split_header(&normalized, path)?;

    check_required(&header)?;
    let target = parse_target(&header)?;
    let compat = parse_compat(&header, &options.runtime_version)?;

    let (body, pre_block) = extract_block(&body, "pre");
    let (body, post_block) = extract_block(&body, "post");
    let (instruction, recovery_body) = split_recovery(&body);
    if instruction.is_empty() {
        return Err(ErrorPayload::new(ErrorCode::MalformedSource, "instruction body is empty")
            .with_detail("path", path.display().to_string())
            .with_hint("Add instruction text after the closing '---' line.")
            .into());
    }

    let recovery = recovery_body.or_else(|| {
        header
            .get("recovery_prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    });

    let uses = parse_uses(path, header.get("uses"))?;

    Ok(ProgramDefinition {
        path: path.to_path_buf(),
        name: scalar_text(&header["name"]).unwrap_or_default(),
        description: scalar_text(&header["description"]).unwrap_or_default(),
        version: scalar_text(&header["version"]).unwrap_or_default(),
        author: scalar_text(&header["author"]).unwrap_or_default(),
        max_context_window: header["max_context_window"].as_u64().unwrap_or_default(),
        input_schema: header["input_schema"].clone(),
        output_schema: header["output_schema"].clone(),
        target,
        instruction,
        recovery,
        uses,
        pre_block,
        post_block,
        compat,
        recommended_models: string_list(header.get("recommended_models")),
        tags: string_list(header.get("tags")),
        metadata: header
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    })
}

fn malformed(message: &str, path: &Path) -> ErrorPayload {
    ErrorPayload::new(ErrorCode::MalformedSource, message)
        .with_detail("path", path.display().to_string())
}

fn split_header(source: &str, path: &Path) -> RunResult<(Map<String, Value>, String)> {
    let Some(rest) = source.strip_prefix("---\n") else {
        return Err(malformed("program must start with a '---' header line", path).into());
    };
    let (header_text, body) = if let Some(body) = rest.strip_prefix("---\n") {
        ("", body)
    } else {
        match rest.split_once("\n---\n") {
            Some(parts) => parts,
            None => {
                return Err(malformed("could not find the closing '---' header line", path)
                    .with_hint("Close the YAML header with a '---' line before the instruction.")
                    .into());
            }
        }
    };

    let header: Value = if header_text.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_yaml_ng::from_str(header_text).map_err(|err| {
            RunError::from(
                malformed("header is not valid YAML", path)
                    .with_detail("yaml_error", err.to_string())
                    .with_hint("Fix the YAML syntax in the header."),
            )
        })?
    };
    match header {
        Value::Object(map) => Ok((map, body.to_string())),
        Value::Null => Ok((Map::new(), body.to_string())),
        other => Err(malformed("header must be a mapping", path)
            .with_detail("actual_type", json_type(&other))
            .into()),
    }
}

fn check_required(header: &Map<String, Value>) -> RunResult<()> {
    let missing: Vec<&str> = REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| !header.contains_key(*field))
        .collect();
    if !missing.is_empty() {
        return Err(
            ErrorPayload::new(ErrorCode::MissingMetadata, "missing required header fields")
                .with_detail("missing_fields", missing)
                .into(),
        );
    }

    let mut invalid = BTreeSet::new();
    for field in ["name", "description", "version", "author"] {
        if scalar_text(&header[field]).is_none_or(|text| text.trim().is_empty()) {
            invalid.insert(field);
        }
    }
    if header["max_context_window"].as_u64().is_none_or(|n| n == 0) {
        invalid.insert("max_context_window");
    }
    for field in ["input_schema", "output_schema", "llm", "llm_params"] {
        if !header[field].is_object() {
            invalid.insert(field);
        }
    }
    if !invalid.is_empty() {
        let fields: Vec<&str> = invalid.into_iter().collect();
        return Err(ErrorPayload::new(
            ErrorCode::MissingMetadata,
            format!("header fields have the wrong type: {}", fields.join(", ")),
        )
        .with_detail("invalid_fields", fields)
        .into());
    }

    for field in ["input_schema", "output_schema"] {
        if let Err(err) = check_schema(&header[field]) {
            return Err(ErrorPayload::new(
                ErrorCode::MissingMetadata,
                format!("{field} is not a valid schema: {err}"),
            )
            .with_detail("field", field)
            .with_detail("path", err.path)
            .with_detail("reason", err.reason)
            .with_expected(header[field].clone())
            .into());
        }
    }
    Ok(())
}

fn parse_target(header: &Map<String, Value>) -> RunResult<InvocationTarget> {
    let model = header["llm"]
        .get("model")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .ok_or_else(|| {
            RunError::from(
                ErrorPayload::new(
                    ErrorCode::MissingMetadata,
                    "llm.model is required and must be a non-empty string",
                )
                .with_detail("llm", header["llm"].clone())
                .with_hint("Set llm.model in the program header."),
            )
        })?;

    let params = header["llm_params"].as_object().cloned().unwrap_or_default();
    let unsupported: Vec<&str> = params
        .keys()
        .map(String::as_str)
        .filter(|key| !ALLOWED_LLM_PARAMS.contains(key))
        .collect();
    if !unsupported.is_empty() {
        return Err(ErrorPayload::new(
            ErrorCode::InvalidParameter,
            format!("unsupported llm_params keys: {}", unsupported.join(", ")),
        )
        .with_detail("unsupported_keys", unsupported)
        .with_detail("allowed_keys", ALLOWED_LLM_PARAMS.to_vec())
        .into());
    }

    Ok(InvocationTarget {
        model: model.to_string(),
        params,
    })
}

fn parse_compat(
    header: &Map<String, Value>,
    running: &Version,
) -> RunResult<Option<RuntimeCompat>> {
    let Some(raw) = header.get("runllm_compat") else {
        return Ok(None);
    };
    let bound = |key: &str| -> RunResult<Option<Version>> {
        let Some(value) = raw.get(key) else {
            return Ok(None);
        };
        scalar_text(value)
            .and_then(|text| text.parse().ok())
            .map(Some)
            .ok_or_else(|| {
                RunError::from(
                    ErrorPayload::new(
                        ErrorCode::MissingMetadata,
                        format!("runllm_compat.{key} is not a version identifier"),
                    )
                    .with_detail("value", value.clone()),
                )
            })
    };
    if !raw.is_object() {
        return Err(ErrorPayload::new(
            ErrorCode::MissingMetadata,
            "runllm_compat must be a mapping with 'min'",
        )
        .into());
    }
    let min = bound("min")?.ok_or_else(|| {
        RunError::from(ErrorPayload::new(
            ErrorCode::MissingMetadata,
            "runllm_compat.min is required",
        ))
    })?;
    let compat = RuntimeCompat {
        min,
        max_exclusive: bound("max_exclusive")?,
    };
    if !compat.contains(running) {
        return Err(ErrorPayload::new(
            ErrorCode::IncompatibleRuntime,
            format!("runtime {running} is outside {compat}"),
        )
        .with_detail("runtime_version", running.to_string())
        .with_detail("min", compat.min.to_string())
        .with_detail(
            "max_exclusive",
            compat
                .max_exclusive
                .map_or(Value::Null, |max| Value::String(max.to_string())),
        )
        .into());
    }
    Ok(Some(compat))
}

fn parse_uses(path: &Path, raw: Option<&Value>) -> RunResult<Vec<DependencySpec>> {
    let entries = match raw {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            return Err(uses_error("uses must be a list", other.clone()));
        }
    };

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(fields) = entry.as_object() else {
            return Err(uses_error("each uses entry must be a mapping", entry.clone()));
        };
        let name = fields.get("name").and_then(scalar_text);
        let target = fields.get("path").and_then(Value::as_str);
        let (Some(name), Some(target)) = (name, target) else {
            return Err(uses_error(
                "each uses entry needs a name and a path",
                entry.clone(),
            ));
        };
        let with = match fields.get("with") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(key, value)| (key.clone(), Binding::from_value(value.clone())))
                .collect(),
            Some(_) => {
                return Err(uses_error("uses.with must be a mapping", entry.clone()));
            }
        };
        if !seen.insert(name.clone()) {
            return Err(uses_error("duplicate uses name", entry.clone())
                .with_detail("name", name.as_str()));
        }
        let joined = base.join(target);
        let resolved = fs::canonicalize(&joined).unwrap_or(joined);
        out.push(DependencySpec {
            name,
            path: resolved,
            with,
        });
    }
    Ok(out)
}

fn uses_error(message: &str, entry: Value) -> RunError {
    ErrorPayload::new(ErrorCode::DependencyResolution, message)
        .with_detail("entry", entry)
        .into()
}

/// Pull one fenced transform block out of the body.
///
/// The block closes at the first line that is exactly "```" after the opener.
fn extract_block(body: &str, stage: &str) -> (String, Option<String>) {
    let opener = format!("{BLOCK_FENCE} {stage}");
    let Some(marker) = body.find(&opener) else {
        return (body.to_string(), None);
    };
    let Some(code_start) = body[marker..].find('\n').map(|i| marker + i + 1) else {
        return (body.to_string(), None);
    };
    let mut line_start = code_start;
    let mut fence = None;
    for line in body[code_start..].split_inclusive('\n') {
        let content = line.trim_end_matches(['\n', '\r']);
        if content.trim() == "```" {
            fence = Some((line_start, line_start + content.len()));
            break;
        }
        line_start += line.len();
    }
    let Some((code_end, fence_end)) = fence else {
        return (body.to_string(), None);
    };
    let code = body[code_start..code_end].trim().to_string();
    let cleaned = format!("{}{}", &body[..marker], &body[fence_end..]);
    (cleaned, Some(code).filter(|code| !code.is_empty()))
}

fn split_recovery(body: &str) -> (String, Option<String>) {
    // Padding lets the marker match on the body's first or last line.
    let padded = format!("\n{body}\n");
    match padded.split_once(RECOVERY_MARKER) {
        Some((instruction, recovery)) => (
            instruction.trim().to_string(),
            Some(recovery.trim().to_string()).filter(|text| !text.is_empty()),
        ),
        None => (body.trim().to_string(), None),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(scalar_text).collect())
        .unwrap_or_default()
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
