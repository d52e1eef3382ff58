#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use wnn_dtype::DataType;
use wnn_reduce::{ReduceError, ReduceOp, ReduceOptions, Tensor, reduced_element_count};

pub const GRAPH_FIXTURE_DIR: &str = "graph";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorFixture {
    pub shape: Vec<usize>,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperandFixture {
    pub data: Vec<f64>,
    pub descriptor: DescriptorFixture,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsFixture {
    #[serde(default)]
    pub axes: Option<Vec<u32>>,
    #[serde(default)]
    pub keep_dimensions: bool,
}

impl OptionsFixture {
    #[must_use]
    pub fn to_options(&self) -> ReduceOptions {
        ReduceOptions {
            axes: self.axes.clone(),
            keep_dimensions: self.keep_dimensions,
        }
    }
}

/// One entry of an operator's argument list: `{"input": "x"}` or
/// `{"options": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperatorArgument {
    Input(String),
    Options(OptionsFixture),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorFixture {
    pub name: String,
    pub arguments: Vec<OperatorArgument>,
    pub outputs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphFixture {
    pub inputs: BTreeMap<String, OperandFixture>,
    pub operators: Vec<OperatorFixture>,
    pub expected_outputs: BTreeMap<String, OperandFixture>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToleranceMetric {
    #[serde(rename = "ULP")]
    Ulp,
    #[serde(rename = "ATOL")]
    Atol,
}

impl ToleranceMetric {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ulp => "ULP",
            Self::Atol => "ATOL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrecisionTolerance {
    pub metric_type: ToleranceMetric,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceFixtureCase {
    pub name: String,
    pub graph: GraphFixture,
    #[serde(default)]
    pub tolerance: Option<PrecisionTolerance>,
    #[serde(default)]
    pub env_fingerprint: String,
    #[serde(default)]
    pub artifact_refs: Vec<String>,
}

/// Default tolerance for an operator whose outputs each fold
/// `reduced_count` input elements.
#[must_use]
pub fn precision_tolerance(op: ReduceOp, reduced_count: usize) -> PrecisionTolerance {
    let n = reduced_count as f64;
    let value = match op {
        ReduceOp::L1 | ReduceOp::Product | ReduceOp::Sum => n,
        ReduceOp::L2 => n * 3.0 + 1.0,
        ReduceOp::LogSum | ReduceOp::LogSumExp => n + 18.0,
        ReduceOp::Max | ReduceOp::Min => 0.0,
        ReduceOp::Mean => n + 2.0,
        ReduceOp::SumSquare => n * 2.0,
    };
    PrecisionTolerance {
        metric_type: ToleranceMetric::Ulp,
        value,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphError {
    UnknownDataType { operand: String, name: String },
    UnknownOperator { name: String },
    UnknownOperand { operator: String, operand: String },
    MissingInputArgument { operator: String },
    Reduce { operand: String, source: ReduceError },
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownDataType { operand, name } => {
                write!(f, "operand '{operand}' has unknown data type '{name}'")
            }
            Self::UnknownOperator { name } => write!(f, "unsupported operator '{name}'"),
            Self::UnknownOperand { operator, operand } => {
                write!(f, "operator '{operator}' references unknown operand '{operand}'")
            }
            Self::MissingInputArgument { operator } => {
                write!(f, "operator '{operator}' has no input argument")
            }
            Self::Reduce { operand, source } => write!(f, "operand '{operand}': {source}"),
        }
    }
}

impl std::error::Error for GraphError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Reduce { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl GraphError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::UnknownDataType { .. } => "graph_unknown_data_type",
            Self::UnknownOperator { .. } => "graph_unknown_operator",
            Self::UnknownOperand { .. } => "graph_unknown_operand",
            Self::MissingInputArgument { .. } => "graph_missing_input_argument",
            Self::Reduce { source, .. } => source.reason_code(),
        }
    }
}

/// The operator that produced a graph operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Producer {
    pub op: ReduceOp,
    pub reduced_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutedGraph {
    pub operands: BTreeMap<String, Tensor>,
    pub producers: BTreeMap<String, Producer>,
}

pub fn build_operand(name: &str, fixture: &OperandFixture) -> Result<Tensor, GraphError> {
    let data_type = DataType::parse(&fixture.descriptor.data_type).ok_or_else(|| {
        GraphError::UnknownDataType {
            operand: name.to_string(),
            name: fixture.descriptor.data_type.clone(),
        }
    })?;
    Tensor::new(
        fixture.descriptor.shape.clone(),
        fixture.data.clone(),
        data_type,
    )
    .map_err(|source| GraphError::Reduce {
        operand: name.to_string(),
        source,
    })
}

/// Runs the graph's operators in order. Every operator output becomes an
/// operand that later operators may consume.
pub fn build_and_execute_graph(graph: &GraphFixture) -> Result<ExecutedGraph, GraphError> {
    let mut executed = ExecutedGraph::default();
    for (name, fixture) in &graph.inputs {
        executed
            .operands
            .insert(name.clone(), build_operand(name, fixture)?);
    }

    for operator in &graph.operators {
        let op = ReduceOp::parse(&operator.name).ok_or_else(|| GraphError::UnknownOperator {
            name: operator.name.clone(),
        })?;

        let mut input_name = None;
        let mut options = ReduceOptions::default();
        for argument in &operator.arguments {
            match argument {
                OperatorArgument::Input(name) => input_name = Some(name),
                OperatorArgument::Options(fixture) => options = fixture.to_options(),
            }
        }
        let Some(input_name) = input_name else {
            return Err(GraphError::MissingInputArgument {
                operator: operator.name.clone(),
            });
        };
        let input = executed
            .operands
            .get(input_name)
            .ok_or_else(|| GraphError::UnknownOperand {
                operator: operator.name.clone(),
                operand: input_name.clone(),
            })?;

        let reduce_err = |source| GraphError::Reduce {
            operand: operator.outputs.clone(),
            source,
        };
        let output = input.reduce(op, &options).map_err(reduce_err)?;
        let reduced_count = reduced_element_count(input.shape(), &options).map_err(reduce_err)?;

        executed.producers.insert(
            operator.outputs.clone(),
            Producer { op, reduced_count },
        );
        executed.operands.insert(operator.outputs.clone(), output);
    }

    Ok(executed)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputComparison {
    pub pass: bool,
    pub max_error: f64,
    pub reason_code: String,
    pub reason: Option<String>,
}

/// Compares one actual operand against its expected fixture.
///
/// Shapes must match exactly. In strict mode the data types must match as
/// well; values are compared with the given tolerance in the expected type.
#[must_use]
pub fn compare_output(
    expected: &OperandFixture,
    actual: &Tensor,
    tolerance: PrecisionTolerance,
    strict_mode: bool,
) -> OutputComparison {
    let fail = |reason_code: &str, reason: String| OutputComparison {
        pass: false,
        max_error: f64::INFINITY,
        reason_code: reason_code.to_string(),
        reason: Some(reason),
    };

    if expected.descriptor.shape != actual.shape() {
        return fail(
            "reduce_shape_mismatch",
            format!(
                "shape mismatch expected={:?} actual={:?}",
                expected.descriptor.shape,
                actual.shape()
            ),
        );
    }

    let expected_type = DataType::parse(&expected.descriptor.data_type);
    if strict_mode && expected_type != Some(actual.data_type()) {
        return fail(
            "reduce_data_type_mismatch",
            format!(
                "data type mismatch expected={} actual={}",
                expected.descriptor.data_type,
                actual.data_type()
            ),
        );
    }
    let compare_type = expected_type.unwrap_or(actual.data_type());

    if expected.data.len() != actual.values().len() {
        return fail(
            "reduce_value_mismatch",
            format!(
                "value length mismatch expected={} actual={}",
                expected.data.len(),
                actual.values().len()
            ),
        );
    }

    let mut max_error = 0.0f64;
    for (idx, (&want, &got)) in expected.data.iter().zip(actual.values()).enumerate() {
        let error = match tolerance.metric_type {
            ToleranceMetric::Ulp => compare_type.ulp_distance(want, got) as f64,
            ToleranceMetric::Atol if want.is_nan() && got.is_nan() => 0.0,
            ToleranceMetric::Atol if want == got => 0.0,
            ToleranceMetric::Atol => (want - got).abs(),
        };
        if error > max_error || error.is_nan() {
            max_error = error;
        }
        if error.is_nan() || error > tolerance.value {
            return OutputComparison {
                pass: false,
                max_error,
                reason_code: "reduce_value_mismatch".to_string(),
                reason: Some(format!(
                    "value mismatch at index {idx}: expected={want} actual={got} error={error} {}={}",
                    tolerance.metric_type.as_str(),
                    tolerance.value
                )),
            };
        }
    }

    OutputComparison {
        pass: true,
        max_error,
        reason_code: "reduce_value_contract".to_string(),
        reason: None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceCaseResult {
    pub name: String,
    pub operator: String,
    pub data_type: String,
    pub env_fingerprint: String,
    pub artifact_refs: Vec<String>,
    pub pass: bool,
    pub max_error: f64,
    pub tolerance: Option<PrecisionTolerance>,
    pub reason_code: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReduceDifferentialReport {
    pub schema_version: u8,
    pub generated_at_unix_ms: u128,
    pub strict_mode: bool,
    pub fixture_digests: BTreeMap<String, String>,
    pub total_cases: usize,
    pub passed_cases: usize,
    pub failed_cases: usize,
    pub results: Vec<ReduceCaseResult>,
}

impl ReduceDifferentialReport {
    pub fn failures(&self) -> impl Iterator<Item = &ReduceCaseResult> {
        self.results.iter().filter(|result| !result.pass)
    }
}

pub(crate) fn normalize_env_fingerprint(raw: &str) -> String {
    if raw.trim().is_empty() {
        "unknown_env".to_string()
    } else {
        raw.trim().to_string()
    }
}

pub(crate) fn normalize_artifact_refs(mut refs: Vec<String>, fallback: &str) -> Vec<String> {
    refs.retain(|entry| !entry.trim().is_empty());
    if refs.is_empty() {
        refs.push(fallback.to_string());
    }
    refs
}

pub(crate) fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Sorted list of the graph fixture files under `fixture_root`.
pub fn graph_fixture_files(fixture_root: &Path) -> Result<Vec<PathBuf>, String> {
    let dir = fixture_root.join(GRAPH_FIXTURE_DIR);
    let entries =
        fs::read_dir(&dir).map_err(|err| format!("failed reading {}: {err}", dir.display()))?;
    let mut files = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

pub fn load_fixture_cases(path: &Path) -> Result<Vec<ReduceFixtureCase>, String> {
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|err| format!("invalid fixture json {}: {err}", path.display()))
}

pub fn write_differential_report(
    path: &Path,
    report: &ReduceDifferentialReport,
) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed creating {}: {err}", parent.display()))?;
    }

    let raw = serde_json::to_string_pretty(report)
        .map_err(|err| format!("failed to serialize differential report: {err}"))?;
    fs::write(path, raw).map_err(|err| format!("failed writing {}: {err}", path.display()))
}

/// Executes one fixture case and checks every expected output.
#[must_use]
pub fn execute_case(case: &ReduceFixtureCase, fixture_ref: &str, strict_mode: bool) -> ReduceCaseResult {
    let operator = case
        .graph
        .operators
        .last()
        .map_or_else(|| "none".to_string(), |op| op.name.clone());
    let data_type = case
        .graph
        .expected_outputs
        .values()
        .next()
        .map_or_else(|| "unknown".to_string(), |out| out.descriptor.data_type.clone());
    let mut result = ReduceCaseResult {
        name: case.name.clone(),
        operator,
        data_type,
        env_fingerprint: normalize_env_fingerprint(&case.env_fingerprint),
        artifact_refs: normalize_artifact_refs(case.artifact_refs.clone(), fixture_ref),
        pass: false,
        max_error: f64::INFINITY,
        tolerance: None,
        reason_code: String::new(),
        reason: None,
    };

    if case.graph.expected_outputs.is_empty() {
        result.reason_code = "reduce_fixture_invalid".to_string();
        result.reason = Some("fixture declares no expected outputs".to_string());
        return result;
    }

    let executed = match build_and_execute_graph(&case.graph) {
        Ok(executed) => executed,
        Err(err) => {
            result.reason_code = err.reason_code().to_string();
            result.reason = Some(err.to_string());
            return result;
        }
    };

    let mut max_error = 0.0f64;
    for (name, expected) in &case.graph.expected_outputs {
        let Some(actual) = executed.operands.get(name) else {
            result.reason_code = "graph_unknown_operand".to_string();
            result.reason = Some(format!("expected output '{name}' was never produced"));
            return result;
        };
        let tolerance = case.tolerance.unwrap_or_else(|| {
            executed.producers.get(name).map_or(
                PrecisionTolerance {
                    metric_type: ToleranceMetric::Ulp,
                    value: 0.0,
                },
                |producer| precision_tolerance(producer.op, producer.reduced_count),
            )
        });
        result.tolerance = Some(tolerance);

        let comparison = compare_output(expected, actual, tolerance, strict_mode);
        max_error = max_error.max(comparison.max_error);
        if !comparison.pass {
            result.max_error = comparison.max_error;
            result.reason_code = comparison.reason_code;
            result.reason = comparison
                .reason
                .map(|reason| format!("output '{name}': {reason}"));
            return result;
        }
        result.reason_code = comparison.reason_code;
    }

    result.pass = true;
    result.max_error = max_error;
    result
}

/// Runs every graph fixture under `fixture_root`.
pub fn run_differential(
    fixture_root: &Path,
    strict_mode: bool,
) -> Result<ReduceDifferentialReport, String> {
    let mut fixture_digests = BTreeMap::new();
    let mut results = Vec::new();

    for path in graph_fixture_files(fixture_root)? {
        let bytes = fs::read(&path)
            .map_err(|err| format!("failed reading {}: {err}", path.display()))?;
        let fixture_ref = path
            .strip_prefix(fixture_root)
            .unwrap_or(path.as_path())
            .to_string_lossy()
            .to_string();
        fixture_digests.insert(fixture_ref.clone(), sha256_hex(&bytes));

        for case in load_fixture_cases(&path)? {
            results.push(execute_case(&case, &fixture_ref, strict_mode));
        }
    }

    let passed_cases = results.iter().filter(|result| result.pass).count();
    Ok(ReduceDifferentialReport {
        schema_version: 1,
        generated_at_unix_ms: now_unix_ms(),
        strict_mode,
        fixture_digests,
        total_cases: results.len(),
        passed_cases,
        failed_cases: results.len() - passed_cases,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::{
        GraphError, OperandFixture, ReduceFixtureCase, ToleranceMetric, build_and_execute_graph,
        compare_output, execute_case, precision_tolerance, sha256_hex,
    };
    use wnn_dtype::DataType;
    use wnn_reduce::{ReduceOp, Tensor};

    fn parse_case(raw: &str) -> ReduceFixtureCase {
        serde_json::from_str(raw).expect("fixture case should parse")
    }

    const SCALAR_CASE: &str = r#"{
        "name": "reduceLogSum float32 0D constant tensor default options",
        "graph": {
            "inputs": {"x": {"data": [64.54827117919922], "descriptor": {"shape": [], "dataType": "float32"}}},
            "operators": [{"name": "reduceLogSum", "arguments": [{"input": "x"}], "outputs": "y"}],
            "expectedOutputs": {"y": {"data": [4.167413234710693], "descriptor": {"shape": [], "dataType": "float32"}}}
        }
    }"#;

    #[test]
    fn scalar_fixture_passes() {
        let case = parse_case(SCALAR_CASE);
        let result = execute_case(&case, "inline", true);
        assert!(result.pass, "{:?}", result.reason);
        assert_eq!(result.operator, "reduceLogSum");
        assert_eq!(result.max_error, 0.0);
        assert_eq!(result.artifact_refs, vec!["inline".to_string()]);
        assert_eq!(result.env_fingerprint, "unknown_env");
    }

    #[test]
    fn options_argument_is_applied() {
        let case = parse_case(
            r#"{
            "name": "axes and keepDimensions",
            "graph": {
                "inputs": {"x": {"data": [1, 2, 3, 4, 5, 6], "descriptor": {"shape": [2, 3], "dataType": "float32"}}},
                "operators": [{"name": "reduceSum", "arguments": [{"input": "x"}, {"options": {"axes": [1], "keepDimensions": true}}], "outputs": "y"}],
                "expectedOutputs": {"y": {"data": [6, 15], "descriptor": {"shape": [2, 1], "dataType": "float32"}}}
            }
        }"#,
        );
        let executed = build_and_execute_graph(&case.graph).expect("graph");
        let y = executed.operands.get("y").expect("y");
        assert_eq!(y.shape(), &[2, 1]);
        assert_eq!(y.values(), &[6.0, 15.0]);
        assert_eq!(executed.producers.get("y").expect("producer").reduced_count, 3);
        assert!(execute_case(&case, "inline", true).pass);
    }

    #[test]
    fn unknown_operand_is_reported() {
        let case = parse_case(
            r#"{
            "name": "dangling",
            "graph": {
                "inputs": {},
                "operators": [{"name": "reduceLogSum", "arguments": [{"input": "missing"}], "outputs": "y"}],
                "expectedOutputs": {"y": {"data": [0], "descriptor": {"shape": [], "dataType": "float32"}}}
            }
        }"#,
        );
        let err = build_and_execute_graph(&case.graph).expect_err("dangling operand");
        assert!(matches!(err, GraphError::UnknownOperand { .. }));
        let result = execute_case(&case, "inline", true);
        assert!(!result.pass);
        assert_eq!(result.reason_code, "graph_unknown_operand");
    }

    #[test]
    fn wrong_expected_value_fails_with_mismatch() {
        let case = parse_case(&SCALAR_CASE.replace("4.167413234710693", "4.2"));
        let result = execute_case(&case, "inline", true);
        assert!(!result.pass);
        assert_eq!(result.reason_code, "reduce_value_mismatch");
        assert!(result.max_error > 18.0);
    }

    #[test]
    fn strict_mode_checks_data_type() {
        let expected = OperandFixture {
            data: vec![1.0],
            descriptor: super::DescriptorFixture {
                shape: vec![],
                data_type: "float16".to_string(),
            },
        };
        let actual = Tensor::scalar(1.0, DataType::Float32);
        let tolerance = precision_tolerance(ReduceOp::LogSum, 1);

        let strict = compare_output(&expected, &actual, tolerance, true);
        assert!(!strict.pass);
        assert_eq!(strict.reason_code, "reduce_data_type_mismatch");

        let relaxed = compare_output(&expected, &actual, tolerance, false);
        assert!(relaxed.pass);
    }

    #[test]
    fn ulp_tolerance_accepts_small_drift() {
        let drifted = f64::from(f32::from_bits(4.0f32.to_bits() + 5));
        let expected = OperandFixture {
            data: vec![4.0],
            descriptor: super::DescriptorFixture {
                shape: vec![1],
                data_type: "float32".to_string(),
            },
        };
        let actual = Tensor::new(vec![1], vec![drifted], DataType::Float32).expect("actual");

        let loose = compare_output(&expected, &actual, precision_tolerance(ReduceOp::Sum, 5), true);
        assert!(loose.pass);
        assert_eq!(loose.max_error, 5.0);

        let tight = compare_output(&expected, &actual, precision_tolerance(ReduceOp::Max, 5), true);
        assert!(!tight.pass);
    }

    #[test]
    fn tolerance_table_scales_with_reduced_count() {
        assert_eq!(precision_tolerance(ReduceOp::LogSum, 24).value, 42.0);
        assert_eq!(precision_tolerance(ReduceOp::L2, 4).value, 13.0);
        assert_eq!(precision_tolerance(ReduceOp::Mean, 6).value, 8.0);
        assert_eq!(precision_tolerance(ReduceOp::SumSquare, 3).value, 6.0);
        assert_eq!(precision_tolerance(ReduceOp::Min, 100).value, 0.0);
        assert_eq!(
            precision_tolerance(ReduceOp::Sum, 1).metric_type,
            ToleranceMetric::Ulp
        );
    }

    #[test]
    fn explicit_tolerance_overrides_default() {
        let raw = SCALAR_CASE.replace("4.167413234710693", "4.17").replacen(
            "\"graph\"",
            "\"tolerance\": {\"metricType\": \"ATOL\", \"value\": 0.01}, \"graph\"",
            1,
        );
        let case = parse_case(&raw);
        let result = execute_case(&case, "inline", true);
        assert!(result.pass, "{:?}", result.reason);
        assert_eq!(
            result.tolerance.expect("tolerance").metric_type,
            ToleranceMetric::Atol
        );
    }

    #[test]
    fn sha256_hex_is_lowercase_hex() {
        let digest = sha256_hex(b"reduceLogSum");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
