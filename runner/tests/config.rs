use std::fs;
use xflow::{
    config::PipelineConfig,
    kernels::FunctionRegistry,
    record,
    record::{Payload, Record, Value},
};

#[test]
fn runs_a_loaded_definition() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.yaml");
    fs::write(
        &path,
        r#"
client:
  name: local
  parameter:
    threads: 2
kernels:
  - interface: ["n ]= {values}"]
  - function: square
  - subprocess:
      template: "printf %s {squared} > result.txt"
      outputs:
        result: result.txt
  - interface: ["squares [= {squared}"]
inputs:
  values: [1, 2, 3]
"#,
    )
    .unwrap();

    let mut registry = FunctionRegistry::new();
    registry.register("square", |record: &Record| {
        let n: i64 = record
            .get("n")
            .and_then(Value::as_str)
            .ok_or("no n")?
            .parse()?;
        Ok(record! { "squared" => n * n })
    });

    let config = PipelineConfig::load(&path).unwrap();
    assert!(!config.preflight_checks());

    let (pipeline, session) = config.build(&registry).unwrap();
    let output = pipeline.run(config.inputs.clone().unwrap()).unwrap();

    let Payload::Single(record) = output else {
        panic!("gather must produce a single record");
    };
    assert_eq!(record.returncode(), Some(0), "{:?}", record.output());
    assert_eq!(record.get("squares"), Some(&Value::from("1 4 9")));

    let result = record.get("result").and_then(Value::as_file).unwrap();
    assert_eq!(result.read().unwrap(), b"1");

    session.purge().unwrap();
}

#[test]
fn dryrun_of_a_definition() {
    let config: PipelineConfig = r#"
client: {name: sync}
kernels:
  - subprocess: {template: "simulate --steps {steps}"}
  - dummy: {fail: true, returncode: 3}
inputs:
  - {steps: 10}
  - {steps: 20}
"#
    .parse()
    .unwrap();

    let (pipeline, _session) = config.build(&FunctionRegistry::new()).unwrap();

    let mut out = Vec::new();
    let output = pipeline
        .dryrun(config.inputs.clone().unwrap(), &mut out)
        .unwrap();
    let report = String::from_utf8(out).unwrap();

    assert!(report.contains("simulate --steps 10\n--------------\nsimulate --steps 20\n"));
    // dryrun never fails a record on purpose
    assert!(output.records().iter().all(|record| record.returncode() == Some(0)));
}
