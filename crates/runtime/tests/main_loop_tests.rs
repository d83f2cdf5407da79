use std::io::Write;
use std::process::{Command, Output};

fn run(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_runtime_main"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to spawn runtime_main")
}

fn summary(output: &Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "runtime_main exited with {:?}\n--- stderr ---\n{}",
        output.status.code(),
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().last().expect("no summary line on stdout");
    serde_json::from_str(line).expect("summary is not JSON")
}

#[test]
fn headless_run_reports_every_tick() {
    let output = run(&["--agents", "64", "--food", "64", "--ticks", "12", "--seed", "3"]);
    let summary = summary(&output);
    assert_eq!(summary["ticks"], 12);
    let rays = &summary["rays"];
    let total = rays["accelerated"].as_u64().unwrap()
        + rays["cpu"].as_u64().unwrap()
        + rays["fallback"].as_u64().unwrap();
    assert_eq!(total, 12);
    assert_eq!(rays["fallback"], 0);
}

#[test]
fn cpu_only_never_accelerates() {
    let output = run(&["--agents", "40", "--ticks", "5", "--cpu-only"]);
    let summary = summary(&output);
    assert_eq!(summary["rays"]["cpu"], 5);
    assert_eq!(summary["inference"]["cpu"], 5);
    assert!(summary["backend"].is_null());
    assert_eq!(summary["ray_state"], "Disabled");
}

#[test]
fn engine_settings_are_read_from_json() {
    let path = std::env::temp_dir().join(format!("runtime-config-{}.json", std::process::id()));
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, r#"{{ "min_accelerated_agents": 100000 }}"#).unwrap();
    drop(file);

    let output = run(&["--agents", "32", "--ticks", "3", "--config", path.to_str().unwrap()]);
    let summary = summary(&output);
    assert_eq!(summary["rays"]["accelerated"], 0);
    std::fs::remove_file(&path).ok();

    let output = run(&["--config", "/definitely/not/here.json"]);
    assert!(!output.status.success());
}
