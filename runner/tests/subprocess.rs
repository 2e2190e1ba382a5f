use std::{fs, sync::Arc, time::Duration};
use xflow::{
    filehandle::{FileHandlerKind, Session},
    kernels::subprocess::{SubprocessKernel, WorkDir, STDOUT, TIMEOUT_RETURNCODE},
    record,
    record::Value,
};

#[test]
fn echo_succeeds() {
    let kernel = SubprocessKernel::new("echo {msg}").unwrap();
    let output = kernel.run(record! { "msg" => "hello", "returncode" => 0 }, false);

    assert_eq!(output.returncode(), Some(0));
    assert!(output.output().unwrap().contains("hello"));
    assert_eq!(output.cmd(), Some("echo hello"));
}

#[test]
fn failing_command_keeps_cmd() {
    let kernel = SubprocessKernel::new("false").unwrap();
    let output = kernel.run(record! { "returncode" => 0 }, false);

    assert_eq!(output.returncode(), Some(1));
    assert_eq!(output.cmd(), Some("false"));

    let kernel = SubprocessKernel::new("echo oops >&2; exit {code}").unwrap();
    let output = kernel.run(record! { "code" => 3 }, false);

    assert_eq!(output.returncode(), Some(3));
    assert_eq!(output.output(), Some("oops\n"));
    assert_eq!(output.cmd(), Some("echo oops >&2; exit 3"));
}

#[test]
fn failed_records_are_not_run() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");

    let kernel = SubprocessKernel::new("touch {marker}").unwrap();
    let mut input = record! { "marker" => marker.to_string_lossy().to_string() };
    input.fail(2, "upstream");

    let output = kernel.run(input.clone(), false);

    assert_eq!(output, input);
    assert!(!marker.exists());
}

#[test]
fn missing_keys_fail_the_record() {
    let kernel = SubprocessKernel::new("echo {nope}").unwrap();
    let output = kernel.run(record! { "msg" => "hello" }, false);

    assert_eq!(output.returncode(), Some(1));
    assert!(output.output().unwrap().contains("nope"));
}

#[test]
fn dryrun_only_builds_the_command() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");

    let kernel = SubprocessKernel::new("touch {marker}").unwrap();
    let output = kernel.run(
        record! { "marker" => marker.to_string_lossy().to_string() },
        true,
    );

    assert_eq!(output.returncode(), Some(0));
    assert_eq!(output.cmd(), Some(format!("touch {}", marker.display()).as_str()));
    assert!(!marker.exists());
}

#[test]
fn timeout_kills_the_command() {
    let kernel = SubprocessKernel::new("sleep 5")
        .unwrap()
        .with_timeout(Duration::from_millis(200));
    let output = kernel.run(record! {}, false);

    assert_eq!(output.returncode(), Some(TIMEOUT_RETURNCODE));
    assert!(output.output().unwrap().contains("timed out"));
}

#[test]
fn scratch_dirs_are_fresh_and_removed() {
    let kernel = SubprocessKernel::new("pwd; ls | wc -l").unwrap();

    let first = kernel.run(record! {}, false);
    let second = kernel.run(record! {}, false);

    let first_lines = first.output().unwrap().lines().collect::<Vec<_>>();
    let second_lines = second.output().unwrap().lines().collect::<Vec<_>>();

    assert_ne!(first_lines[0], second_lines[0]);
    assert_eq!(first_lines[1].trim(), "0");
    assert!(!std::path::Path::new(first_lines[0]).exists());
}

#[test]
fn inherit_runs_in_the_current_dir() {
    let kernel = SubprocessKernel::new("pwd")
        .unwrap()
        .with_workdir(WorkDir::Inherit);
    let output = kernel.run(record! {}, false);

    let cwd = std::env::current_dir().unwrap();
    assert_eq!(
        fs::canonicalize(output.output().unwrap().trim()).unwrap(),
        fs::canonicalize(cwd).unwrap()
    );
}

#[test]
fn stages_inputs_and_collects_outputs() {
    let session = Arc::new(Session::new(FileHandlerKind::Memory));
    let source = tempfile::tempdir().unwrap();
    let path = source.path().join("data.txt");
    fs::write(&path, "a\nb\nc\n").unwrap();

    let mut kernel = SubprocessKernel::new("wc -l < {data} > count.txt; cp {data} copy1.txt; cp {data} copy2.txt; echo done")
        .unwrap()
        .with_session(session.clone());
    kernel.set_inputs([("data", "input.txt")]);
    kernel
        .set_outputs([("count", "count.txt"), ("copies", "copy*.txt"), ("log", STDOUT)])
        .unwrap();

    let input = record! { "data" => session.load(&path).unwrap() };
    let output = kernel.run(input, false);

    assert_eq!(output.returncode(), Some(0), "{:?}", output.output());
    assert_eq!(output.cmd(), Some("wc -l < input.txt > count.txt; cp input.txt copy1.txt; cp input.txt copy2.txt; echo done"));
    assert_eq!(output.get("log"), Some(&Value::from("done\n")));

    let count = output.get("count").and_then(Value::as_file).unwrap();
    assert_eq!(String::from_utf8(count.read().unwrap()).unwrap().trim(), "3");

    match output.get("copies") {
        Some(Value::Files(copies)) => {
            assert_eq!(copies.len(), 2);
            assert!(copies[0].origin().ends_with("copy1.txt"));
            assert_eq!(copies[1].read().unwrap(), b"a\nb\nc\n");
        }
        other => panic!("expected a list of files, got {other:?}"),
    }
}

#[test]
fn missing_output_fails() {
    let mut kernel = SubprocessKernel::new("true").unwrap();
    kernel.set_outputs([("result", "result.dat")]).unwrap();

    let output = kernel.run(record! {}, false);
    assert_eq!(output.returncode(), Some(1));
    assert!(output.output().unwrap().contains("result.dat"));
}

#[test]
fn file_lists_are_numbered() {
    let session = Arc::new(Session::new(FileHandlerKind::Memory));
    let source = tempfile::tempdir().unwrap();
    let handles = (0..3)
        .map(|i| {
            let path = source.path().join(format!("in{i}.pdb"));
            fs::write(&path, format!("frame {i}\n")).unwrap();
            session.load(&path).unwrap()
        })
        .collect::<Vec<_>>();

    let mut kernel = SubprocessKernel::new("cat {frames}")
        .unwrap()
        .with_session(session.clone());
    kernel.set_inputs([("frames", "frame*.pdb")]);

    let output = kernel.run(record! { "frames" => handles }, false);

    assert_eq!(output.returncode(), Some(0), "{:?}", output.output());
    assert_eq!(output.cmd(), Some("cat frame0.pdb frame1.pdb frame2.pdb"));
    assert_eq!(output.output(), Some("frame 0\nframe 1\nframe 2\n"));
}

#[test]
fn file_constants_are_staged() {
    let source = tempfile::tempdir().unwrap();
    let path = source.path().join("topology.prmtop");
    fs::write(&path, "TOPOLOGY").unwrap();

    let mut kernel = SubprocessKernel::new("cat {top} && echo ' {label}'").unwrap();
    kernel
        .set_constant("top", path.to_string_lossy().to_string())
        .unwrap();
    kernel.set_constant("label", "fixed").unwrap();

    let output = kernel.run(record! {}, false);

    assert_eq!(output.returncode(), Some(0), "{:?}", output.output());
    assert_eq!(output.cmd(), Some("cat topology.prmtop && echo ' fixed'"));
    assert_eq!(output.output(), Some("TOPOLOGY fixed\n"));
    // constants stay out of the record
    assert!(output.get("top").is_none());
}

#[test]
fn inputs_must_be_files() {
    let mut kernel = SubprocessKernel::new("cat {data}").unwrap();
    kernel.set_inputs([("data", "input.txt")]);

    let output = kernel.run(record! { "data" => "plain string" }, false);
    assert_eq!(output.returncode(), Some(1));
    assert!(output.output().unwrap().contains("not a file"));
}
