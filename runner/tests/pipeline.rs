use xflow::{
    clients::{Client, LocalClient, SyncClient},
    kernels::{DummyKernel, FunctionKernel, InterfaceKernel, Kernel, SubprocessKernel},
    record,
    record::{Payload, Record, Value},
    Pipeline,
};

fn replicate_kernels() -> Vec<Kernel> {
    vec![
        InterfaceKernel::parse(["rep ]= {reps}", "template $= echo rep={rep}"])
            .unwrap()
            .into(),
        SubprocessKernel::from_record_cmd().into(),
    ]
}

fn check_replicates<C: Client>(pipeline: &Pipeline<C>) {
    let output = pipeline.run(record! { "reps" => "0 1 2 3" }).unwrap();
    let records = output.records();

    assert!(output.is_many());
    assert_eq!(records.len(), 4);

    for (index, record) in records.iter().enumerate() {
        assert_eq!(record.returncode(), Some(0));
        assert_eq!(record.get("rep"), Some(&Value::from(index.to_string())));
        assert_eq!(record.cmd(), Some(format!("echo rep={index}").as_str()));
        assert_eq!(record.output(), Some(format!("rep={index}\n").as_str()));
    }
}

#[test]
fn replicates_with_sync_client() {
    check_replicates(&Pipeline::new(SyncClient::new(), replicate_kernels()));
}

#[test]
fn replicates_with_local_client() {
    check_replicates(&Pipeline::new(LocalClient::new(4).unwrap(), replicate_kernels()));
}

#[test]
fn scatter_compute_gather() {
    let kernels: Vec<Kernel> = vec![
        InterfaceKernel::parse(["copy > {copies}", "template = printf %s-{copy} out"])
            .unwrap()
            .into(),
        SubprocessKernel::from_record_cmd().into(),
        InterfaceKernel::parse(["results < {output}", "count ?= 1 + 1"])
            .unwrap()
            .into(),
    ];
    let pipeline = Pipeline::new(LocalClient::new(2).unwrap(), kernels);

    let output = pipeline.run(record! { "copies" => "c1 c2 c3" }).unwrap();
    let Payload::Single(record) = output else {
        panic!("gather must produce a single record");
    };

    assert_eq!(record.returncode(), Some(0));
    assert_eq!(record.get("results"), Some(&Value::from("out-c1 out-c2 out-c3")));
    assert_eq!(record.get("count"), Some(&Value::Int(2)));
}

#[test]
fn list_inputs_are_mapped() {
    let kernels: Vec<Kernel> = vec![
        InterfaceKernel::parse(["next ?= {i} * 10"]).unwrap().into(),
        FunctionKernel::new("double", |record: &Record| {
            let next = record.get("next").and_then(Value::as_int).ok_or("no next")?;
            Ok(record! { "doubled" => next * 2 })
        })
        .into(),
    ];
    let pipeline = Pipeline::new(LocalClient::new(3).unwrap(), kernels);

    let inputs = (0..5).map(|i| record! { "i" => i }).collect::<Vec<_>>();
    let output = pipeline.run(inputs).unwrap();

    let doubled = output
        .records()
        .iter()
        .filter_map(|record| record.get("doubled").and_then(Value::as_int))
        .collect::<Vec<_>>();
    assert_eq!(doubled, vec![0, 20, 40, 60, 80]);
}

#[test]
fn failures_fall_through() {
    let downstream = DummyKernel::new();
    let kernels: Vec<Kernel> = vec![
        InterfaceKernel::parse(["x > {xs}"]).unwrap().into(),
        DummyKernel::failing(7, "broken").unwrap().into(),
        InterfaceKernel::parse(["y = {x}-after"]).unwrap().into(),
        downstream.clone().into(),
    ];
    let pipeline = Pipeline::new(SyncClient::new(), kernels);

    let output = pipeline.run(record! { "xs" => "a b" }).unwrap();

    assert_eq!(output.records().len(), 2);
    for record in output.records() {
        assert_eq!(record.returncode(), Some(7));
        assert_eq!(record.output(), Some("broken"));
        assert!(record.get("y").is_none());
    }
    assert_eq!(downstream.calls(), 0);
}

#[test]
fn one_failed_branch_poisons_the_gather() {
    let kernels: Vec<Kernel> = vec![
        InterfaceKernel::parse(["x > {xs}", "template = test {x} != bad"])
            .unwrap()
            .into(),
        SubprocessKernel::from_record_cmd().into(),
        InterfaceKernel::parse(["all < {x}"]).unwrap().into(),
    ];
    let pipeline = Pipeline::new(LocalClient::new(2).unwrap(), kernels);

    let output = pipeline.run(record! { "xs" => "good bad fine" }).unwrap();
    let Payload::Single(record) = output else {
        panic!("gather must produce a single record");
    };

    assert_eq!(record.returncode(), Some(1));
    assert_eq!(record.get("x"), Some(&Value::from("bad")));
    assert!(record.get("all").is_none());
}

#[test]
fn dryrun_prints_commands() {
    let counter = DummyKernel::new();
    let kernels: Vec<Kernel> = vec![
        InterfaceKernel::parse(["rep ]= {reps}", "template $= md -r {rep:02d}"])
            .unwrap()
            .into(),
        SubprocessKernel::from_record_cmd().into(),
        counter.clone().into(),
    ];
    let pipeline = Pipeline::new(SyncClient::new(), kernels);

    let mut out = Vec::new();
    let output = pipeline
        .dryrun(record! { "reps" => vec!["1", "2"] }, &mut out)
        .unwrap();

    assert_eq!(
        String::from_utf8(out).unwrap(),
        "===== Kernel 0 =====\n\
         md -r 01\n\
         --------------\n\
         md -r 02\n\
         --------------\n\
         ===== Kernel 1 =====\n\
         dummy\n\
         --------------\n\
         dummy\n\
         --------------\n\
         ======================\n"
    );
    assert_eq!(output.records().len(), 2);
    assert_eq!(counter.calls(), 0);
}

#[test]
fn dryrun_reports_errors() {
    let kernels: Vec<Kernel> = vec![
        InterfaceKernel::parse(["template = run {missing}"]).unwrap().into(),
        SubprocessKernel::from_record_cmd().into(),
    ];
    let pipeline = Pipeline::new(SyncClient::new(), kernels);

    let mut out = Vec::new();
    pipeline.dryrun(record! { "x" => 1 }, &mut out).unwrap();

    let report = String::from_utf8(out).unwrap();
    assert!(report.starts_with("===== Kernel 0 =====\nError: "));
    assert!(report.contains("missing"));
    assert!(report.ends_with("======================\n"));
}
