//! 错误处理模块测试

use psi_flow::error::ClassifierError;

#[test]
fn test_error_creation() {
    let err = ClassifierError::allocation_failure("endpoint context");
    assert!(matches!(err, ClassifierError::AllocationFailure { .. }));
    assert!(err.is_recoverable());
}

#[test]
fn test_error_codes() {
    assert_eq!(ClassifierError::allocation_failure("x").error_code(), 1001);
    assert_eq!(ClassifierError::syntax(3, "x").error_code(), 1002);
    assert_eq!(ClassifierError::consistency_conflict("x").error_code(), 1003);
    assert_eq!(ClassifierError::structural_violation("x").error_code(), 1004);
    assert_eq!(ClassifierError::session_busy("hosts").error_code(), 1005);
    assert_eq!(ClassifierError::session_closed("hosts").error_code(), 1006);
    assert_eq!(ClassifierError::unknown_protocol("x").error_code(), 1007);
    assert_eq!(ClassifierError::config_error("x").error_code(), 1008);
    assert_eq!(ClassifierError::internal_error("x").error_code(), 1999);
}

#[test]
fn test_error_display() {
    let err = ClassifierError::syntax(7, "bad port '70000'");
    let display = format!("{}", err);
    assert!(display.contains("line 7"));
    assert!(display.contains("70000"));
}

#[test]
fn test_at_line_fills_unknown_line() {
    let err = ClassifierError::syntax(0, "missing protocol").at_line(4);
    assert!(matches!(err, ClassifierError::ConfigSyntax { line: 4, .. }));

    let err = ClassifierError::syntax(2, "x").at_line(9);
    assert!(matches!(err, ClassifierError::ConfigSyntax { line: 2, .. }));

    let err = ClassifierError::unknown_protocol("foo").at_line(9);
    assert!(matches!(err, ClassifierError::UnknownProtocol { .. }));
}

#[test]
fn test_error_classification() {
    let config_err = ClassifierError::config_error("test");
    assert!(config_err.is_config_error());
    assert!(!config_err.is_recoverable());

    assert!(ClassifierError::structural_violation("overlap").is_config_error());
    assert!(ClassifierError::session_busy("rules").is_recoverable());
    assert!(!ClassifierError::internal_error("x").is_config_error());
}

#[test]
fn test_error_conversion() {
    let io_err = std::io::Error::new(std::io::ErrorKind::Other, "thread spawn");
    let err: ClassifierError = io_err.into();
    assert!(matches!(err, ClassifierError::IoError(_)));
    assert_eq!(err.error_code(), 1009);

    let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
    let err: ClassifierError = json_err.into();
    assert!(err.is_config_error());

    let any_err = anyhow::anyhow!("boom");
    let err: ClassifierError = any_err.into();
    assert!(matches!(err, ClassifierError::InternalError { .. }));
}
