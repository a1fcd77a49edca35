#![cfg(unix)]
//! 실제 PTY 셸 통합 테스트 (unix 전용)
//! bash나 PTY를 쓸 수 없는 환경에서는 건너뜀

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use runbox_core::shell::{InteractiveShellSession, LineObserver, ShellError, ShellSessionConfig};
use runbox_core::utils::strip_ansi;

fn session(cwd: &Path) -> Option<InteractiveShellSession> {
    let has_bash = ["/bin/bash", "/usr/bin/bash"].iter().any(|p| Path::new(p).exists());
    if !has_bash {
        println!("⚠ bash not found, skipping");
        return None;
    }
    let config = ShellSessionConfig::for_host(cwd, vec![("RUNBOX_MARK".into(), "pty-ok".into())]);
    Some(InteractiveShellSession::new(config))
}

#[tokio::test]
async fn test_exit_codes_and_output() {
    let dir = tempfile::tempdir().unwrap();
    let Some(shell) = session(dir.path()) else { return };

    let first = match shell.execute("true", None).await {
        Ok(result) => result,
        Err(ShellError::Open(reason)) => {
            println!("⚠ cannot open pty ({}), skipping", reason);
            return;
        }
        Err(e) => panic!("unexpected error: {}", e),
    };
    assert_eq!(first.exit_code, 0);
    assert!(shell.is_open().await);

    assert_eq!(shell.execute("false", None).await.unwrap().exit_code, 1);
    assert_eq!(shell.execute("(exit 42)", None).await.unwrap().exit_code, 42);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer: &LineObserver = &move |line: &str| sink.lock().unwrap().push(strip_ansi(line));
    let result = shell.execute("echo $RUNBOX_MARK", Some(observer)).await.unwrap();
    assert!(result.success());
    assert!(result.output.iter().any(|l| strip_ansi(l).trim() == "pty-ok"));
    assert!(seen.lock().unwrap().iter().any(|l| l.trim() == "pty-ok"));

    shell.close().await;
    assert!(!shell.is_open().await);

    // 닫힌 뒤 다음 명령은 새 셸을 연다
    assert_eq!(shell.execute("true", None).await.unwrap().exit_code, 0);
    shell.close().await;
}

#[tokio::test]
async fn test_commands_run_in_order_and_keep_state() {
    let dir = tempfile::tempdir().unwrap();
    let Some(shell) = session(dir.path()) else { return };

    match shell.execute("export RUNBOX_STEP=one", None).await {
        Ok(r) => assert_eq!(r.exit_code, 0),
        Err(ShellError::Open(_)) => return,
        Err(e) => panic!("unexpected error: {}", e),
    }
    let result = shell.execute("echo step-$RUNBOX_STEP", None).await.unwrap();
    assert!(result.output.iter().any(|l| strip_ansi(l).trim() == "step-one"));
    shell.close().await;
}

#[tokio::test]
async fn test_silent_commands_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let Some(shell) = session(dir.path()) else { return };

    // 출력이 없는 명령은 마커 줄이 clear 출력과 같은 줄에 붙어 온다
    let result = tokio::time::timeout(Duration::from_secs(20), shell.execute(":", None)).await;
    match result.expect("silent command never reported its status") {
        Ok(r) => assert_eq!(r.exit_code, 0),
        Err(ShellError::Open(_)) => return,
        Err(e) => panic!("unexpected error: {}", e),
    }
    let result = tokio::time::timeout(Duration::from_secs(20), shell.execute("cd .", None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.exit_code, 0);
    shell.close().await;
}

#[tokio::test]
async fn test_concurrent_callers_get_their_own_status() {
    let dir = tempfile::tempdir().unwrap();
    let Some(shell) = session(dir.path()) else { return };

    match shell.execute("true", None).await {
        Ok(_) => {}
        Err(ShellError::Open(_)) => return,
        Err(e) => panic!("unexpected error: {}", e),
    }

    let job = |i: i32| format!("echo job-{i}; (exit {i})");
    let (a, b, c) = (job(3), job(4), job(5));
    let (ra, rb, rc) = tokio::time::timeout(Duration::from_secs(30), async {
        tokio::join!(
            shell.execute(&a, None),
            shell.execute(&b, None),
            shell.execute(&c, None)
        )
    })
    .await
    .expect("queued commands did not all finish");

    for (i, result) in [(3, ra), (4, rb), (5, rc)] {
        let result = result.unwrap();
        assert_eq!(result.exit_code, i);
        let own: Vec<String> = result.output.iter().map(|l| strip_ansi(l).trim().to_string()).collect();
        assert!(own.iter().any(|l| *l == format!("job-{}", i)), "job {} output: {:?}", i, own);
        for other in [3, 4, 5].into_iter().filter(|o| *o != i) {
            assert!(!own.iter().any(|l| *l == format!("job-{}", other)));
        }
        println!("✓ job {} → exit {}", i, i);
    }
    shell.close().await;
}
