use std::path::{Path, PathBuf};
use std::sync::Arc;

use acquire_engine::sandbox::{AllowedDirs, Permissions, Sandbox};
use acquire_engine::Error;

fn sandbox(data_dir: &Path, allowed: Arc<AllowedDirs>, file: bool) -> Sandbox {
    let permissions = Permissions {
        file,
        network: vec!["api.example.com".into(), "*.cdn.example.net".into()],
    };
    Sandbox::new("sandbox-test", permissions, data_dir, allowed).unwrap()
}

#[test]
fn relative_paths_resolve_inside_data_dir() {
    let root = tempfile::tempdir().unwrap();
    let data = root.path().join("data");
    let sb = sandbox(&data, Arc::new(AllowedDirs::new()), true);

    assert_eq!(sb.validate_path("covers/a.jpg").unwrap(), data.join("covers/a.jpg"));
    assert_eq!(sb.validate_path("x/../y.txt").unwrap(), data.join("y.txt"));
    assert_eq!(sb.validate_path("./").unwrap(), data);
}

#[test]
fn escaping_relative_paths_are_traversal() {
    let root = tempfile::tempdir().unwrap();
    let sb = sandbox(&root.path().join("data"), Arc::new(AllowedDirs::new()), true);

    for path in ["../secret", "a/../../b", "../../../../etc/passwd", "a/b/../../../data2/x"] {
        let err = sb.validate_path(path).unwrap_err();
        assert!(
            matches!(err, Error::PathTraversal { .. }),
            "{} gave {:?}",
            path,
            err
        );
    }
}

#[test]
fn absolute_paths_need_a_registered_prefix() {
    let root = tempfile::tempdir().unwrap();
    let allowed = Arc::new(AllowedDirs::new());
    let sb = sandbox(&root.path().join("data"), Arc::clone(&allowed), true);
    let music = root.path().join("Music");
    let target = music.join("Artist").join("song.flac");
    let target_str = target.to_string_lossy().to_string();

    assert!(matches!(
        sb.validate_path(&target_str).unwrap_err(),
        Error::PermissionDenied(_)
    ));

    allowed.add(&music);
    assert_eq!(sb.validate_path(&target_str).unwrap(), target);

    // Component-wise: a sibling sharing the textual prefix is not inside
    let sibling = root.path().join("Music2").join("x.flac");
    assert!(sb.validate_path(&sibling.to_string_lossy()).is_err());

    // Cleaning happens before the prefix check
    let sneaky = format!("{}/../outside.flac", music.display());
    assert!(sb.validate_path(&sneaky).is_err());

    allowed.set(&[]);
    assert!(sb.validate_path(&target_str).is_err());
}

#[test]
fn allowed_dirs_are_shared_between_sandboxes() {
    let root = tempfile::tempdir().unwrap();
    let allowed = Arc::new(AllowedDirs::new());
    let a = sandbox(&root.path().join("a"), Arc::clone(&allowed), true);
    let b = sandbox(&root.path().join("b"), Arc::clone(&allowed), true);
    let dl: PathBuf = root.path().join("downloads");
    allowed.set(&[dl.clone()]);

    let file = dl.join("t.flac");
    assert!(a.validate_path(&file.to_string_lossy()).is_ok());
    assert!(b.validate_path(&file.to_string_lossy()).is_ok());
    assert_eq!(allowed.snapshot(), vec![dl]);
}

#[test]
fn file_permission_is_required() {
    let root = tempfile::tempdir().unwrap();
    let sb = sandbox(&root.path().join("data"), Arc::new(AllowedDirs::new()), false);
    let err = sb.validate_path("a.txt").unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert!(err.is_sandbox_violation());
}

#[test]
fn domains_are_checked_against_manifest() {
    let root = tempfile::tempdir().unwrap();
    let sb = sandbox(&root.path().join("data"), Arc::new(AllowedDirs::new()), true);

    assert!(sb.validate_domain("https://api.example.com/v1/track").is_ok());
    assert!(sb.validate_domain("https://eu.api.example.com/v1").is_ok());
    assert!(sb.validate_domain("https://img.cdn.example.net/a.jpg").is_ok());
    assert!(sb.validate_domain("https://API.EXAMPLE.COM/").is_ok());

    assert!(matches!(
        sb.validate_domain("https://example.com/").unwrap_err(),
        Error::DomainNotAllowed { .. }
    ));
    assert!(sb.validate_domain("https://cdn.example.net/").is_err());
    assert!(sb.validate_domain("file:///etc/passwd").is_err());
    assert!(sb.validate_domain("not a url").is_err());
}
