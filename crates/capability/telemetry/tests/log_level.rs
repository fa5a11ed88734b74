use gw_telemetry::init_tracing;

#[test]
fn log_level_handle_reloads() {
    let handle = init_tracing("info");
    assert!(handle.set("debug"));
    assert!(handle.set("gw_bus=trace,info"));
    // 非法指令不生效，保留旧过滤器。
    assert!(!handle.set("=="));
}
