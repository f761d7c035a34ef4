//! Tests for error handling

use crate::Error;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::duplicate("component", "Sensor");
        assert_eq!(err.to_string(), "Duplicate component registration: 'Sensor'");

        let err = Error::not_found("model", "MainModel");
        assert_eq!(err.to_string(), "model 'MainModel' not found");

        let err = Error::timeout("thread shutdown", 5000);
        assert_eq!(
            err.to_string(),
            "Operation timed out after 5000ms: thread shutdown"
        );

        let err = Error::invalid_state("Worker", crate::ThreadState::Running, "start");
        assert_eq!(err.to_string(), "Cannot start 'Worker' in state Running");
    }

    #[test]
    fn test_error_is_retryable() {
        // Retryable errors
        assert!(Error::connection_msg("connection lost").is_retryable());
        assert!(Error::timeout("handshake", 500).is_retryable());
        assert!(Error::runtime_msg("task failed").is_retryable());

        // Non-retryable errors
        assert!(!Error::duplicate("thread", "Main").is_retryable());
        assert!(!Error::not_found("component", "Missing").is_retryable());
        assert!(!Error::protocol("bad frame", None, None).is_retryable());
        assert!(!Error::configuration("invalid config", None).is_retryable());
        assert!(!Error::invalid_state("Router", "Paused", "pause").is_retryable());
        assert!(!Error::thread_msg("spawn failed").is_retryable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(Error::thread_msg("spawn failed").category(), "thread");
        assert_eq!(Error::duplicate("model", "m").category(), "registration");
        assert_eq!(Error::not_found("thread", "t").category(), "lookup");
        assert_eq!(Error::connection_msg("err").category(), "connection");
        assert_eq!(Error::timeout("op", 1000).category(), "timeout");
        assert_eq!(Error::runtime_msg("err").category(), "runtime");
        assert_eq!(
            Error::configuration("err", None).category(),
            "configuration"
        );
        assert_eq!(
            Error::invalid_state("t", "Idle", "destroy").category(),
            "lifecycle"
        );
    }

    #[test]
    fn test_error_with_source() {
        use std::io;

        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::from(io_err);

        match err {
            Error::Io { message, source } => {
                assert!(message.contains("refused"));
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_error_context_fields() {
        let err = Error::configuration("invalid port", Some("router.port".to_string()));
        match err {
            Error::Configuration { message, field } => {
                assert_eq!(message, "invalid port");
                assert_eq!(field, Some("router.port".to_string()));
            }
            _ => panic!("Expected Configuration error"),
        }

        let err = Error::protocol(
            "unexpected message",
            Some("HelloServer".to_string()),
            Some("RegisterService".to_string()),
        );
        match err {
            Error::Protocol {
                message,
                expected,
                received,
            } => {
                assert_eq!(message, "unexpected message");
                assert_eq!(expected, Some("HelloServer".to_string()));
                assert_eq!(received, Some("RegisterService".to_string()));
            }
            _ => panic!("Expected Protocol error"),
        }
    }

    #[test]
    fn test_bincode_error_conversion() {
        let data = vec![0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<String, bincode::Error> = bincode::deserialize(&data);

        if let Err(bincode_err) = result {
            let err: Error = bincode_err.into();
            assert!(matches!(err, Error::Serialization { .. }));
            assert!(err.to_string().contains("Bincode serialization failed"));
        }
    }

    #[test]
    fn test_toml_error_conversion() {
        let result: Result<crate::config::AppConfig, toml::de::Error> = toml::from_str("[router\nport = ");
        let err: Error = result.unwrap_err().into();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
