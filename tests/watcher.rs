use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use watchfs::{Error, Event, Op, Watcher};

/// How long to wait for the kernel and the reader to propagate events.
const TOLERANCE: Duration = Duration::from_millis(250);

type EventLog = Arc<Mutex<Vec<Event>>>;

/// Creates a watcher and a background collector draining its events into a
/// shared log.
fn watcher_with_log() -> anyhow::Result<(Watcher, EventLog)> {
    let _ = env_logger::try_init();
    let watcher = Watcher::new()?;
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));

    let rx = watcher.events().clone();
    let sink = Arc::clone(&log);
    thread::spawn(move || {
        for event in rx {
            sink.lock().unwrap().push(event);
        }
    });

    let errors = watcher.errors().clone();
    thread::spawn(move || {
        for error in errors {
            eprintln!("unexpected watcher error: {error}");
        }
    });

    Ok((watcher, log))
}

/// Waits for pending events, then takes everything collected so far.
fn drain(log: &EventLog) -> Vec<Event> {
    thread::sleep(TOLERANCE);
    log.lock().unwrap().drain(..).collect()
}

fn check_events(label: &str, log: &EventLog, want: Vec<(PathBuf, Op)>) {
    let want: Vec<Event> = want.into_iter().map(|(path, op)| Event { path, op }).collect();
    let have = drain(log);
    assert_eq!(want, have, "unexpected events ({label})");
}

fn append(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(data)?;
    Ok(())
}

#[test]
fn create_write_remove_create() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let file = tmp.path().join("file");
    let (watcher, log) = watcher_with_log()?;
    watcher.add(tmp.path())?;

    File::create(&file)?;
    check_events("create", &log, vec![(file.clone(), Op::CREATE)]);

    append(&file, b"data")?;
    check_events("write", &log, vec![(file.clone(), Op::WRITE)]);

    fs::remove_file(&file)?;
    check_events("remove", &log, vec![(file.clone(), Op::REMOVE)]);

    // Recreating the file must be reported as a fresh create.
    File::create(&file)?;
    check_events("recreate", &log, vec![(file.clone(), Op::CREATE)]);

    Ok(())
}

#[test]
fn file_existing_before_watch() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let before_watch = tmp.path().join("beforewatch");
    let file = tmp.path().join("file");
    File::create(&before_watch)?;

    let (watcher, log) = watcher_with_log()?;
    watcher.add(tmp.path())?;

    // The pre-existing file must not show up as created...
    File::create(&file)?;
    check_events("create", &log, vec![(file.clone(), Op::CREATE)]);

    fs::remove_file(&file)?;
    check_events("remove", &log, vec![(file.clone(), Op::REMOVE)]);

    // ...but its removal is still reported.
    fs::remove_file(&before_watch)?;
    check_events("remove pre-existing", &log, vec![(before_watch.clone(), Op::REMOVE)]);

    Ok(())
}

#[test]
fn subdirectories_are_not_recursive() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let sub = tmp.path().join("sub");
    let nested = sub.join("file2");
    let file = tmp.path().join("file");

    let (watcher, log) = watcher_with_log()?;
    watcher.add(tmp.path())?;

    fs::create_dir(&sub)?;
    check_events("mkdir", &log, vec![(sub.clone(), Op::CREATE)]);

    // A file inside the subdirectory is invisible: we watch tmp, not sub.
    File::create(&nested)?;
    check_events("nested create", &log, vec![]);

    File::create(&file)?;
    check_events("create", &log, vec![(file.clone(), Op::CREATE)]);

    fs::remove_dir_all(&sub)?;
    check_events("rmdir", &log, vec![(sub.clone(), Op::REMOVE)]);

    fs::remove_file(&file)?;
    check_events("remove", &log, vec![(file.clone(), Op::REMOVE)]);

    Ok(())
}

#[test]
fn chmod_watched_file() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let file = tmp.path().join("file");
    File::create(&file)?;

    let (watcher, log) = watcher_with_log()?;
    watcher.add(&file)?;

    fs::set_permissions(&file, fs::Permissions::from_mode(0o700))?;
    check_events("chmod", &log, vec![(file.clone(), Op::CHMOD)]);

    // A plain write must not be reported as CHMOD.
    append(&file, b"more data")?;
    check_events("write", &log, vec![(file.clone(), Op::WRITE)]);

    fs::set_permissions(&file, fs::Permissions::from_mode(0o600))?;
    check_events("chmod again", &log, vec![(file.clone(), Op::CHMOD)]);

    Ok(())
}

#[test]
fn rename_file_in_watched_dir() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let file = tmp.path().join("file");
    let renamed = tmp.path().join("renamed");

    let (watcher, log) = watcher_with_log()?;
    watcher.add(tmp.path())?;

    File::create(&file)?;
    check_events("create", &log, vec![(file.clone(), Op::CREATE)]);

    fs::rename(&file, &renamed)?;
    check_events(
        "rename",
        &log,
        vec![(file.clone(), Op::RENAME), (renamed.clone(), Op::CREATE)],
    );

    Ok(())
}

#[test]
fn rename_overwriting_existing_file() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let renamed = tmp.path().join("renamed");
    File::create(&renamed)?;

    let (watcher, log) = watcher_with_log()?;
    watcher.add(tmp.path())?;

    let unwatched = tempfile::tempdir()?;
    let file = unwatched.path().join("file");
    File::create(&file)?;
    fs::rename(&file, &renamed)?;

    // inotify reports only the arrival; kqueue sees the overwritten file's
    // vnode die first and recovers the replacement as a create.
    #[cfg(target_os = "linux")]
    check_events("overwrite", &log, vec![(renamed.clone(), Op::CREATE)]);
    #[cfg(not(target_os = "linux"))]
    check_events(
        "overwrite",
        &log,
        vec![(renamed.clone(), Op::REMOVE), (renamed.clone(), Op::CREATE)],
    );

    Ok(())
}

#[test]
fn watch_list_tracks_add_and_remove() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let tmp = tempfile::tempdir()?;
    let file = tmp.path().join("file");
    File::create(&file)?;

    let watcher = Watcher::new()?;
    assert!(watcher.watch_list().is_empty());

    watcher.add(&file)?;
    assert_eq!(watcher.watch_list(), vec![file.clone()]);

    // Re-adding must not duplicate the watch.
    watcher.add(&file)?;
    assert_eq!(watcher.watch_list(), vec![file.clone()]);

    watcher.remove(&file)?;
    assert!(watcher.watch_list().is_empty());

    watcher.close()?;
    Ok(())
}

#[test]
fn equivalent_spellings_share_one_watch() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let tmp = tempfile::tempdir()?;
    let file = tmp.path().join("file");
    File::create(&file)?;

    let watcher = Watcher::new()?;
    watcher.add(&file)?;
    // `a/./b` and `a/b/` collapse to the key registered above.
    watcher.add(tmp.path().join(".").join("file"))?;
    let mut trailing = file.clone().into_os_string();
    trailing.push("/");
    watcher.add(PathBuf::from(trailing))?;

    assert_eq!(watcher.watch_list(), vec![file.clone()]);
    Ok(())
}

#[test]
fn remove_unknown_path() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let tmp = tempfile::tempdir()?;
    let watcher = Watcher::new()?;

    let err = watcher.remove(tmp.path()).unwrap_err();
    assert!(matches!(err, Error::NonExistentWatch(_)), "got: {err}");

    // Removing twice: the second call must fail the same way.
    watcher.add(tmp.path())?;
    watcher.remove(tmp.path())?;
    let err = watcher.remove(tmp.path()).unwrap_err();
    assert!(matches!(err, Error::NonExistentWatch(_)), "got: {err}");
    Ok(())
}

#[test]
fn add_socket_and_fifo_is_benign() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let tmp = tempfile::tempdir()?;

    let fifo = tmp.path().join("fifo");
    mkfifo(&fifo)?;
    let socket = tmp.path().join("sock");
    let _listener = std::os::unix::net::UnixListener::bind(&socket)?;

    let watcher = Watcher::new()?;
    watcher.add(&fifo)?;
    watcher.add(&socket)?;
    assert!(watcher.watch_list().is_empty());
    Ok(())
}

#[test]
fn unreadable_member_is_remembered_but_not_watched() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let unreadable = tmp.path().join("file-unreadable");
    let file = tmp.path().join("file");
    File::create(&unreadable)?;
    fs::set_permissions(&unreadable, fs::Permissions::from_mode(0))?;
    File::create(&file)?;

    let (watcher, log) = watcher_with_log()?;
    watcher.add(tmp.path())?;

    // Pre-existing members are remembered, not announced, readable or not.
    check_events("after add", &log, vec![]);

    // A later directory change reports only the genuinely new member: the
    // unreadable one was recorded even though no watch could be opened for
    // it, so it must not resurface as "new" here.
    let extra = tmp.path().join("extra");
    File::create(&extra)?;
    check_events("new member", &log, vec![(extra.clone(), Op::CREATE)]);

    append(&file, b"hello")?;
    check_events("write readable member", &log, vec![(file.clone(), Op::WRITE)]);

    // Without a watch of its own, the unreadable member's removal is
    // invisible on kqueue. When running as root the permission bits don't
    // bite and it got a regular watch, so check what actually held.
    let open_was_denied = File::open(&unreadable).is_err();
    fs::remove_file(&unreadable)?;
    if cfg!(target_os = "linux") || !open_was_denied {
        check_events("remove unreadable", &log, vec![(unreadable.clone(), Op::REMOVE)]);
    } else {
        check_events("remove unreadable", &log, vec![]);
    }
    Ok(())
}

#[test]
fn add_unresolvable_symlink_is_benign() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let tmp = tempfile::tempdir()?;
    let link = tmp.path().join("link");
    std::os::unix::fs::symlink(tmp.path().join("does-not-exist"), &link)?;

    let watcher = Watcher::new()?;
    watcher.add(&link)?;
    assert!(watcher.watch_list().is_empty());
    Ok(())
}

#[test]
fn no_events_after_remove() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let file = tmp.path().join("file");
    File::create(&file)?;

    let (watcher, log) = watcher_with_log()?;
    watcher.add(tmp.path())?;
    watcher.remove(tmp.path())?;
    thread::sleep(TOLERANCE);
    drain(&log);

    append(&file, b"data")?;
    fs::set_permissions(&file, fs::Permissions::from_mode(0o700))?;
    check_events("after remove", &log, vec![]);
    Ok(())
}

#[test]
fn no_events_after_close() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let file = tmp.path().join("file");

    let (watcher, log) = watcher_with_log()?;
    watcher.add(tmp.path())?;
    watcher.close()?;

    File::create(&file)?;
    fs::remove_file(&file)?;
    check_events("after close", &log, vec![]);
    assert!(watcher.watch_list().is_empty());
    Ok(())
}

#[test]
fn close_is_idempotent_and_fails_later_adds() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let tmp = tempfile::tempdir()?;
    let watcher = Watcher::new()?;
    watcher.add(tmp.path())?;

    watcher.close()?;
    watcher.close()?;

    let err = watcher.add(tmp.path()).unwrap_err();
    assert!(matches!(err, Error::Closed), "got: {err}");
    Ok(())
}

#[test]
fn close_works_when_events_are_not_read() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let tmp = tempfile::tempdir()?;
    let watcher = Watcher::new()?;
    watcher.add(tmp.path())?;

    // Generate events nobody consumes: the reader ends up parked in a send,
    // and close() must still return.
    File::create(tmp.path().join("file"))?;
    fs::remove_file(tmp.path().join("file"))?;
    thread::sleep(TOLERANCE);

    watcher.close()?;
    Ok(())
}

#[test]
fn concurrent_remove_has_one_winner() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let tmp = tempfile::tempdir()?;
    File::create(tmp.path().join("file"))?;

    for _ in 0..10 {
        let watcher = Watcher::new()?;
        watcher.add(tmp.path())?;

        let results: Vec<Result<(), Error>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| scope.spawn(|| watcher.remove(tmp.path())))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let successes = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successes, 1, "exactly one remove must win: {results:?}");
        for result in results {
            if let Err(err) = result {
                assert!(matches!(err, Error::NonExistentWatch(_)), "got: {err}");
            }
        }
        watcher.close()?;
    }
    Ok(())
}

#[test]
fn close_concurrent_with_remove() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let tmp = tempfile::tempdir()?;
    File::create(tmp.path().join("file"))?;

    for _ in 0..10 {
        let watcher = Watcher::new()?;
        watcher.add(tmp.path())?;

        let (close_res, remove_res) = thread::scope(|scope| {
            let closer = scope.spawn(|| watcher.close());
            let remover = scope.spawn(|| watcher.remove(tmp.path()));
            (closer.join().unwrap(), remover.join().unwrap())
        });

        // close always succeeds; remove either won the race or found the
        // watcher already closed (or its watch already swept).
        close_res?;
        if let Err(err) = remove_res {
            assert!(
                matches!(err, Error::Closed | Error::NonExistentWatch(_)),
                "got: {err}"
            );
        }

        // Whatever the interleaving, the end state is the same.
        assert!(watcher.watch_list().is_empty());
        let err = watcher.remove(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::Closed), "got: {err}");
        let err = watcher.add(tmp.path()).unwrap_err();
        assert!(matches!(err, Error::Closed), "got: {err}");
    }
    Ok(())
}

#[test]
fn drop_closes_the_streams() -> anyhow::Result<()> {
    let _ = env_logger::try_init();
    let tmp = tempfile::tempdir()?;
    let watcher = Watcher::new()?;
    watcher.add(tmp.path())?;

    let events = watcher.events().clone();
    drop(watcher);

    // The reader must have terminated and disconnected the channel.
    let collected: Vec<Event> = events.iter().collect();
    assert!(collected.is_empty(), "got: {collected:?}");
    Ok(())
}

/// std has no wrapper for mkfifo(2).
fn mkfifo(path: &Path) -> anyhow::Result<()> {
    let status = std::process::Command::new("mkfifo").arg(path).status()?;
    anyhow::ensure!(status.success(), "mkfifo {path:?} failed: {status}");
    Ok(())
}
