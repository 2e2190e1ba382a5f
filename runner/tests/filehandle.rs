use std::{fs, path::Path};
use xflow::filehandle::{FileHandleError, FileHandlerKind, Session};

fn source(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("input.txt");
    fs::write(&path, "some data\n").unwrap();
    path
}

#[test]
fn handler_names() {
    assert_eq!("tmp".parse::<FileHandlerKind>().unwrap(), FileHandlerKind::Tmp);
    assert_eq!("Shared".parse::<FileHandlerKind>().unwrap(), FileHandlerKind::Shared);
    assert_eq!("memory".parse::<FileHandlerKind>().unwrap(), FileHandlerKind::Memory);
    assert!(matches!(
        "bogus".parse::<FileHandlerKind>(),
        Err(FileHandleError::UnknownHandler(name)) if name == "bogus"
    ));
}

#[test]
fn memory_handles_outlive_the_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = source(dir.path());

    let session = Session::new(FileHandlerKind::Memory);
    let handle = session.load(&path).unwrap();
    fs::remove_file(&path).unwrap();

    assert_eq!(handle.read().unwrap(), b"some data\n");
    assert!(handle.origin().ends_with("input.txt"));

    let target = dir.path().join("restored.txt");
    handle.save(&target).unwrap();
    assert_eq!(fs::read_to_string(&target).unwrap(), "some data\n");

    let copy = handle.as_file().unwrap();
    assert_eq!(copy.extension().unwrap(), "txt");
    assert_eq!(fs::read(&copy).unwrap(), b"some data\n");
    fs::remove_file(copy).unwrap();

    assert_eq!(session.session_dir().unwrap(), None);
    assert!(session.purge().is_ok());
}

#[test]
fn tmp_handles_are_removed_on_drop() {
    let dir = tempfile::tempdir().unwrap();
    let path = source(dir.path());

    let session = Session::new(FileHandlerKind::Tmp);
    let handle = session.load(&path).unwrap();
    let stored = handle.as_file().unwrap();

    assert_ne!(stored, fs::canonicalize(&path).unwrap());
    assert!(stored.starts_with(session.session_dir().unwrap().unwrap()));
    assert_eq!(fs::read(&stored).unwrap(), b"some data\n");

    let clone = handle.clone();
    drop(handle);
    assert!(stored.exists());

    drop(clone);
    assert!(!stored.exists());
    // the source is never touched
    assert!(path.exists());

    session.purge().unwrap();
    assert!(!session.session_dir().unwrap().unwrap().exists());
}

#[test]
fn shared_handles_live_below_the_shared_dir() {
    if std::env::var_os(xflow::filehandle::SHARED_ENV).is_some() {
        return;
    }

    let shared = tempfile::tempdir().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = source(dir.path());

    let session = Session::new(FileHandlerKind::Shared).with_shared_dir(shared.path());
    let handle = session.load(&path).unwrap();

    let session_dir = session.session_dir().unwrap().unwrap();
    assert!(session_dir.starts_with(shared.path()));
    assert!(handle.as_file().unwrap().starts_with(&session_dir));
    assert_eq!(handle.read().unwrap(), b"some data\n");

    session.purge().unwrap();
    assert!(!session_dir.exists());
}

#[test]
fn shared_without_a_dir_fails() {
    if std::env::var_os(xflow::filehandle::SHARED_ENV).is_some() {
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let path = source(dir.path());

    let session = Session::new(FileHandlerKind::Shared);
    assert!(matches!(session.load(&path), Err(FileHandleError::SharedNotSet)));
}

#[test]
fn missing_files_are_reported() {
    let session = Session::default();
    assert!(matches!(
        session.load("/definitely/not/here.txt"),
        Err(FileHandleError::Io { .. })
    ));
}
