#![forbid(unsafe_code)]

pub mod reduce_differential;

use crate::reduce_differential::{
    DescriptorFixture, GraphFixture, OperandFixture, OperatorArgument, OperatorFixture,
    OptionsFixture, build_and_execute_graph, normalize_artifact_refs, normalize_env_fingerprint,
    precision_tolerance,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use wnn_dtype::DataType;
use wnn_ndarray::reduced_shape;
use wnn_reduce::{ReduceOp, ReduceOptions, Tensor, reduced_element_count, resolve_axes};

pub const REDUCE_LOG_PATH_ENV: &str = "WNN_REDUCE_LOG_PATH";
pub const FIXTURE_ROOT_ENV: &str = "WNN_FIXTURE_ROOT";
pub const REPORT_ROOT_ENV: &str = "WNN_REPORT_ROOT";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub report_root: PathBuf,
    pub strict_mode: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        Self {
            fixture_root: manifest_dir.join("fixtures"),
            report_root: manifest_dir.join("../../target/conformance"),
            strict_mode: true,
        }
    }

    /// Applies `WNN_FIXTURE_ROOT` and `WNN_REPORT_ROOT` when set and non-empty.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(root) = env_path(FIXTURE_ROOT_ENV) {
            self.fixture_root = root;
        }
        if let Some(root) = env_path(REPORT_ROOT_ENV) {
            self.report_root = root;
        }
        self
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixtures_present: bool,
    pub fixture_count: usize,
    pub strict_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteReport {
    pub suite: &'static str,
    pub case_count: usize,
    pub pass_count: usize,
    pub failures: Vec<String>,
}

impl SuiteReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.case_count == self.pass_count && self.failures.is_empty()
    }
}

/// One JSON line per executed case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReduceLogRecord {
    pub fixture_id: String,
    pub suite: String,
    pub operator: String,
    pub data_type: String,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub reason_code: String,
    pub max_error: Option<f64>,
    pub passed: bool,
}

impl ReduceLogRecord {
    #[must_use]
    pub fn is_replay_complete(&self) -> bool {
        !self.fixture_id.trim().is_empty()
            && !self.suite.trim().is_empty()
            && !self.operator.trim().is_empty()
            && !self.env_fingerprint.trim().is_empty()
            && !self.reason_code.trim().is_empty()
            && !self.artifact_refs.is_empty()
            && self
                .artifact_refs
                .iter()
                .all(|artifact| !artifact.trim().is_empty())
    }
}

static REDUCE_LOG_PATH: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();

pub fn set_reduce_log_path(path: Option<PathBuf>) {
    let cell = REDUCE_LOG_PATH.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = cell.lock() {
        *slot = path;
    }
}

fn maybe_append_reduce_log(entry: &ReduceLogRecord) -> Result<(), String> {
    let configured = REDUCE_LOG_PATH
        .get()
        .and_then(|cell| cell.lock().ok())
        .and_then(|slot| slot.clone());
    let from_env = std::env::var_os(REDUCE_LOG_PATH_ENV).map(PathBuf::from);
    let Some(path) = configured.or(from_env) else {
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| format!("failed opening {}: {err}", path.display()))?;
    let line = serde_json::to_string(entry)
        .map_err(|err| format!("failed serializing reduce log entry: {err}"))?;
    let mut payload = line.into_bytes();
    payload.push(b'\n');
    file.write_all(&payload)
        .map_err(|err| format!("failed appending reduce log {}: {err}", path.display()))
}

fn finite_or_none(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn count_fixture_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .ok()
        .into_iter()
        .flat_map(|it| it.filter_map(Result::ok))
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                count_fixture_files(&path)
            } else {
                usize::from(path.extension().is_some_and(|ext| ext == "json"))
            }
        })
        .sum()
}

#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    HarnessReport {
        suite: "smoke",
        fixtures_present: config.fixture_root.exists(),
        fixture_count: count_fixture_files(&config.fixture_root),
        strict_mode: config.strict_mode,
    }
}

pub fn run_reduce_differential_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let report = reduce_differential::run_differential(&config.fixture_root, config.strict_mode)?;
    let report_path = config.report_root.join("reduce_differential_report.json");
    reduce_differential::write_differential_report(&report_path, &report)?;

    for result in &report.results {
        maybe_append_reduce_log(&ReduceLogRecord {
            fixture_id: result.name.clone(),
            suite: "reduce_differential".to_string(),
            operator: result.operator.clone(),
            data_type: result.data_type.clone(),
            env_fingerprint: result.env_fingerprint.clone(),
            artifact_refs: result.artifact_refs.clone(),
            reason_code: result.reason_code.clone(),
            max_error: finite_or_none(result.max_error),
            passed: result.pass,
        })?;
    }

    let failures = report
        .failures()
        .map(|failure| {
            format!(
                "{}: operator={} data_type={} reason_code={} env_fingerprint={} artifact_refs={} {}",
                failure.name,
                failure.operator,
                failure.data_type,
                failure.reason_code,
                failure.env_fingerprint,
                failure.artifact_refs.join(","),
                failure.reason.as_deref().unwrap_or("no reason provided")
            )
        })
        .collect();

    Ok(SuiteReport {
        suite: "reduce_differential",
        case_count: report.total_cases,
        pass_count: report.passed_cases,
        failures,
    })
}

fn default_float32_name() -> String {
    DataType::Float32.name().to_string()
}

fn default_log_sum_name() -> String {
    ReduceOp::LogSum.name().to_string()
}

#[derive(Debug, Deserialize)]
struct ReduceMetamorphicCase {
    id: String,
    relation: String,
    shape: Vec<usize>,
    values: Vec<f64>,
    #[serde(default = "default_float32_name")]
    data_type: String,
    #[serde(default)]
    axes: Option<Vec<u32>>,
    #[serde(default)]
    second_axes: Option<Vec<u32>>,
    #[serde(default)]
    env_fingerprint: String,
    #[serde(default)]
    artifact_refs: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReduceAdversarialCase {
    id: String,
    #[serde(default = "default_log_sum_name")]
    operator: String,
    shape: Vec<usize>,
    values: Vec<f64>,
    #[serde(default = "default_float32_name")]
    data_type: String,
    #[serde(default)]
    axes: Option<Vec<u32>>,
    #[serde(default)]
    keep_dimensions: bool,
    expect_success: bool,
    #[serde(default)]
    expected_shape: Option<Vec<usize>>,
    #[serde(default)]
    expected_reason_code: String,
    #[serde(default)]
    expected_error_contains: String,
    #[serde(default)]
    env_fingerprint: String,
    #[serde(default)]
    artifact_refs: Vec<String>,
}

fn load_cases<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, String> {
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
    serde_json::from_str(&raw).map_err(|err| format!("invalid json {}: {err}", path.display()))
}

fn log_sum(input: &Tensor, axes: Option<Vec<u32>>, keep_dimensions: bool) -> Result<Tensor, String> {
    input
        .reduce_log_sum(&ReduceOptions {
            axes,
            keep_dimensions,
        })
        .map_err(|err| err.to_string())
}

fn within_ulps(data_type: DataType, expected: &[f64], actual: &[f64], ulps: f64) -> bool {
    expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .all(|(&e, &a)| data_type.ulp_distance(e, a) as f64 <= ulps)
}

fn check_keepdims_flat_equivalence(case: &ReduceMetamorphicCase, input: &Tensor) -> Result<(), String> {
    let dropped = log_sum(input, case.axes.clone(), false)?;
    let kept = log_sum(input, case.axes.clone(), true)?;
    if dropped.values() != kept.values() {
        return Err("keepDimensions changed the flat values".to_string());
    }
    let mask = resolve_axes(input.rank(), case.axes.as_deref()).map_err(|err| err.to_string())?;
    let expected_kept = reduced_shape(input.shape(), &mask, true);
    let expected_dropped = reduced_shape(input.shape(), &mask, false);
    if kept.shape() != expected_kept.as_slice() || dropped.shape() != expected_dropped.as_slice() {
        return Err(format!(
            "shapes kept={:?} dropped={:?} expected kept={expected_kept:?} dropped={expected_dropped:?}",
            kept.shape(),
            dropped.shape()
        ));
    }
    Ok(())
}

fn check_axes_order_insensitive(case: &ReduceMetamorphicCase, input: &Tensor) -> Result<(), String> {
    let Some(axes) = case.axes.clone() else {
        return Err("axes_order_insensitive requires axes".to_string());
    };
    let mut reversed = axes.clone();
    reversed.reverse();
    let forward = log_sum(input, Some(axes), false)?;
    let backward = log_sum(input, Some(reversed), false)?;
    if forward != backward {
        return Err(format!(
            "axes order changed the result: {:?} vs {:?}",
            forward.values(),
            backward.values()
        ));
    }
    Ok(())
}

fn check_full_reduction_scalar(input: &Tensor) -> Result<(), String> {
    let out = log_sum(input, None, false)?;
    if out.rank() != 0 {
        return Err(format!("full reduction produced shape {:?}", out.shape()));
    }
    let total: f64 = input.values().iter().sum();
    let expected = input.data_type().round_on_store(total.ln());
    let tolerance = precision_tolerance(ReduceOp::LogSum, input.values().len());
    if !within_ulps(input.data_type(), &[expected], out.values(), tolerance.value) {
        return Err(format!(
            "full reduction {:?} differs from ln(sum)={expected}",
            out.values()
        ));
    }
    Ok(())
}

fn check_staged_log_sum(case: &ReduceMetamorphicCase, input: &Tensor) -> Result<(), String> {
    let (Some(first), Some(second)) = (case.axes.clone(), case.second_axes.clone()) else {
        return Err("staged_log_sum requires axes and second_axes".to_string());
    };
    let joint_axes = first.iter().chain(&second).copied().collect::<Vec<_>>();
    let joint_count = reduced_element_count(
        input.shape(),
        &ReduceOptions::with_axes(joint_axes.clone()),
    )
    .map_err(|err| err.to_string())?;
    let joint = log_sum(input, Some(joint_axes), true)?;

    let partial = log_sum(input, Some(first), true)?;
    let exponentiated = Tensor::new(
        partial.shape().to_vec(),
        partial.values().iter().map(|v| v.exp()).collect(),
        partial.data_type(),
    )
    .map_err(|err| err.to_string())?;
    let staged = log_sum(&exponentiated, Some(second), true)?;

    if joint.shape() != staged.shape() {
        return Err(format!(
            "staged shape {:?} differs from joint shape {:?}",
            staged.shape(),
            joint.shape()
        ));
    }
    let tolerance = precision_tolerance(ReduceOp::LogSum, joint_count);
    if !within_ulps(input.data_type(), joint.values(), staged.values(), tolerance.value) {
        return Err(format!(
            "staged values {:?} differ from joint values {:?}",
            staged.values(),
            joint.values()
        ));
    }
    Ok(())
}

pub fn run_reduce_metamorphic_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let path = config.fixture_root.join("reduce_metamorphic_cases.json");
    let cases: Vec<ReduceMetamorphicCase> = load_cases(&path)?;

    let mut report = SuiteReport {
        suite: "reduce_metamorphic",
        case_count: cases.len(),
        pass_count: 0,
        failures: Vec::new(),
    };

    for case in cases {
        let env_fingerprint = normalize_env_fingerprint(&case.env_fingerprint);
        let artifact_refs =
            normalize_artifact_refs(case.artifact_refs.clone(), "reduce_metamorphic_cases.json");

        let outcome = DataType::parse(&case.data_type)
            .ok_or_else(|| format!("unknown data type '{}'", case.data_type))
            .and_then(|data_type| {
                Tensor::new(case.shape.clone(), case.values.clone(), data_type)
                    .map_err(|err| err.to_string())
            })
            .and_then(|input| match case.relation.as_str() {
                "keepdims_flat_equivalence" => check_keepdims_flat_equivalence(&case, &input),
                "axes_order_insensitive" => check_axes_order_insensitive(&case, &input),
                "full_reduction_scalar" => check_full_reduction_scalar(&input),
                "staged_log_sum" => check_staged_log_sum(&case, &input),
                other => Err(format!("unknown relation '{other}'")),
            });

        let passed = outcome.is_ok();
        maybe_append_reduce_log(&ReduceLogRecord {
            fixture_id: case.id.clone(),
            suite: "reduce_metamorphic".to_string(),
            operator: ReduceOp::LogSum.name().to_string(),
            data_type: case.data_type.clone(),
            env_fingerprint: env_fingerprint.clone(),
            artifact_refs: artifact_refs.clone(),
            reason_code: format!("reduce_metamorphic_{}", case.relation),
            max_error: None,
            passed,
        })?;

        match outcome {
            Ok(()) => report.pass_count += 1,
            Err(detail) => report.failures.push(format!(
                "{}: relation={} env_fingerprint={} artifact_refs={} {detail}",
                case.id,
                case.relation,
                env_fingerprint,
                artifact_refs.join(",")
            )),
        }
    }

    Ok(report)
}

fn single_operator_graph(case: &ReduceAdversarialCase) -> GraphFixture {
    let mut inputs = BTreeMap::new();
    inputs.insert(
        "input".to_string(),
        OperandFixture {
            data: case.values.clone(),
            descriptor: DescriptorFixture {
                shape: case.shape.clone(),
                data_type: case.data_type.clone(),
            },
        },
    );
    GraphFixture {
        inputs,
        operators: vec![OperatorFixture {
            name: case.operator.clone(),
            arguments: vec![
                OperatorArgument::Input("input".to_string()),
                OperatorArgument::Options(OptionsFixture {
                    axes: case.axes.clone(),
                    keep_dimensions: case.keep_dimensions,
                }),
            ],
            outputs: "output".to_string(),
        }],
        expected_outputs: BTreeMap::new(),
    }
}

fn evaluate_adversarial_case(case: &ReduceAdversarialCase) -> Result<String, String> {
    let expected_error = case.expected_error_contains.trim().to_lowercase();
    if !case.expect_success && expected_error.is_empty() {
        return Err("expected_error_contains must be non-empty for error-expected cases".to_string());
    }
    if case.expect_success && case.expected_shape.is_none() {
        return Err("expect_success=true requires expected_shape".to_string());
    }

    match build_and_execute_graph(&single_operator_graph(case)) {
        Ok(executed) => {
            if !case.expect_success {
                return Err(format!(
                    "expected failure containing '{}' but the graph executed",
                    case.expected_error_contains
                ));
            }
            let Some(output) = executed.operands.get("output") else {
                return Err("graph produced no output operand".to_string());
            };
            if Some(output.shape()) != case.expected_shape.as_deref() {
                return Err(format!(
                    "shape mismatch expected={:?} actual={:?}",
                    case.expected_shape,
                    output.shape()
                ));
            }
            Ok("reduce_adversarial_accepted".to_string())
        }
        Err(err) => {
            let reason_code = err.reason_code().to_string();
            if case.expect_success {
                return Err(format!("expected success but failed: {err} ({reason_code})"));
            }
            let message = err.to_string().to_lowercase();
            if !message.contains(&expected_error) {
                return Err(format!(
                    "error '{err}' does not contain '{}'",
                    case.expected_error_contains
                ));
            }
            if !case.expected_reason_code.trim().is_empty()
                && case.expected_reason_code.trim() != reason_code
            {
                return Err(format!(
                    "reason_code mismatch expected={} actual={reason_code}",
                    case.expected_reason_code.trim()
                ));
            }
            Ok(reason_code)
        }
    }
}

pub fn run_reduce_adversarial_suite(config: &HarnessConfig) -> Result<SuiteReport, String> {
    let path = config.fixture_root.join("reduce_adversarial_cases.json");
    let cases: Vec<ReduceAdversarialCase> = load_cases(&path)?;

    let mut report = SuiteReport {
        suite: "reduce_adversarial",
        case_count: cases.len(),
        pass_count: 0,
        failures: Vec::new(),
    };

    for case in cases {
        let env_fingerprint = normalize_env_fingerprint(&case.env_fingerprint);
        let artifact_refs =
            normalize_artifact_refs(case.artifact_refs.clone(), "reduce_adversarial_cases.json");
        let outcome = evaluate_adversarial_case(&case);

        maybe_append_reduce_log(&ReduceLogRecord {
            fixture_id: case.id.clone(),
            suite: "reduce_adversarial".to_string(),
            operator: case.operator.clone(),
            data_type: case.data_type.clone(),
            env_fingerprint: env_fingerprint.clone(),
            artifact_refs: artifact_refs.clone(),
            reason_code: outcome
                .as_ref()
                .map_or_else(|_| "reduce_adversarial_violation".to_string(), Clone::clone),
            max_error: None,
            passed: outcome.is_ok(),
        })?;

        match outcome {
            Ok(_) => report.pass_count += 1,
            Err(detail) => report.failures.push(format!(
                "{}: operator={} expected_reason_code={} env_fingerprint={} artifact_refs={} {detail}",
                case.id,
                case.operator,
                case.expected_reason_code,
                env_fingerprint,
                artifact_refs.join(",")
            )),
        }
    }

    Ok(report)
}

pub fn run_all_core_suites(config: &HarnessConfig) -> Result<Vec<SuiteReport>, String> {
    Ok(vec![
        run_reduce_differential_suite(config)?,
        run_reduce_metamorphic_suite(config)?,
        run_reduce_adversarial_suite(config)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::{
        HarnessConfig, ReduceAdversarialCase, ReduceLogRecord, SuiteReport,
        evaluate_adversarial_case, maybe_append_reduce_log, set_reduce_log_path,
    };
    use std::fs;
    use std::path::PathBuf;

    fn temp_file(name: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        std::env::temp_dir().join(format!("wnn_{name}_{ts}.jsonl"))
    }

    fn record(fixture_id: &str) -> ReduceLogRecord {
        ReduceLogRecord {
            fixture_id: fixture_id.to_string(),
            suite: "reduce_differential".to_string(),
            operator: "reduceLogSum".to_string(),
            data_type: "float32".to_string(),
            env_fingerprint: "tests".to_string(),
            artifact_refs: vec!["graph/reduce_log_sum_cases.json".to_string()],
            reason_code: "reduce_value_contract".to_string(),
            max_error: Some(0.0),
            passed: true,
        }
    }

    fn adversarial(raw: &str) -> ReduceAdversarialCase {
        serde_json::from_str(raw).expect("adversarial case should parse")
    }

    #[test]
    fn default_paths_point_at_crate_fixtures() {
        let cfg = HarnessConfig::default_paths();
        assert!(cfg.fixture_root.ends_with("fixtures"));
        assert!(cfg.strict_mode);
    }

    #[test]
    fn suite_report_all_passed_requires_full_count() {
        let report = SuiteReport {
            suite: "reduce_metamorphic",
            case_count: 2,
            pass_count: 1,
            failures: Vec::new(),
        };
        assert!(!report.all_passed());
    }

    #[test]
    fn log_record_is_replay_complete() {
        assert!(record("case").is_replay_complete());

        let mut missing = record("case");
        missing.artifact_refs = vec![" ".to_string()];
        assert!(!missing.is_replay_complete());

        let mut blank = record("  ");
        blank.reason_code = String::new();
        assert!(!blank.is_replay_complete());
    }

    #[test]
    fn configured_log_path_receives_json_lines() {
        let path = temp_file("reduce_log");
        set_reduce_log_path(Some(path.clone()));
        maybe_append_reduce_log(&record("first")).expect("append first");
        maybe_append_reduce_log(&record("second")).expect("append second");
        set_reduce_log_path(None);

        let raw = fs::read_to_string(&path).expect("read log");
        let lines = raw
            .lines()
            .map(|line| serde_json::from_str::<ReduceLogRecord>(line).expect("json line"))
            .collect::<Vec<_>>();
        assert!(lines.len() >= 2);
        assert!(lines.iter().any(|line| line.fixture_id == "first"));
        assert!(lines.iter().any(|line| line.fixture_id == "second"));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn adversarial_case_matches_reason_code() {
        let case = adversarial(
            r#"{"id": "dup", "shape": [2, 2], "values": [1, 2, 3, 4], "axes": [0, 0],
                "expect_success": false, "expected_reason_code": "reduce_duplicate_axis",
                "expected_error_contains": "duplicate"}"#,
        );
        assert_eq!(
            evaluate_adversarial_case(&case).expect("case should hold"),
            "reduce_duplicate_axis"
        );
    }

    #[test]
    fn adversarial_case_flags_wrong_reason_code() {
        let case = adversarial(
            r#"{"id": "oob", "shape": [2], "values": [1, 2], "axes": [1],
                "expect_success": false, "expected_reason_code": "reduce_duplicate_axis",
                "expected_error_contains": "out of bounds"}"#,
        );
        let err = evaluate_adversarial_case(&case).expect_err("reason code differs");
        assert!(err.contains("reason_code mismatch"));
    }

    #[test]
    fn adversarial_case_requires_error_substring() {
        let case = adversarial(
            r#"{"id": "bare", "shape": [1], "values": [1], "expect_success": false}"#,
        );
        assert!(evaluate_adversarial_case(&case).is_err());
    }

    #[test]
    fn adversarial_success_checks_shape() {
        let case = adversarial(
            r#"{"id": "ok", "shape": [2, 3], "values": [1, 2, 3, 4, 5, 6], "axes": [1],
                "keep_dimensions": true, "expect_success": true, "expected_shape": [2, 1]}"#,
        );
        assert!(evaluate_adversarial_case(&case).is_ok());
    }
}
