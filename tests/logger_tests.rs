use psi_flow::utils::logger::{backend_installed, get_logger, init_logger, LogLevel, LoggerConfig};
use psi_flow::{flow_error, flow_trace};

#[test]
fn test_init_installs_backend() {
    let config = LoggerConfig {
        enabled: true,
        level: LogLevel::Trace,
        ..LoggerConfig::default()
    };
    assert!(init_logger(config).unwrap());
    assert!(backend_installed());

    let logger = get_logger().unwrap();
    assert!(logger.is_enabled(&LogLevel::Trace));
    flow_error!("logger test error record");
    flow_trace!("logger test trace record");

    // 第二次初始化不生效，沿用已有级别
    let quieter = LoggerConfig {
        level: LogLevel::Error,
        ..LoggerConfig::default()
    };
    assert!(!init_logger(quieter).unwrap());
    assert_eq!(get_logger().unwrap().config().level, LogLevel::Trace);
    assert!(backend_installed());
}
