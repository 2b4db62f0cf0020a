//! Translation of librdkafka failures into [`LogError`].

use beacon_core::log::LogError;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use std::time::Duration;

/// Classify a client error. `timeout` is the deadline the failed call ran with.
pub(crate) fn map_kafka_error(error: &KafkaError, timeout: Duration) -> LogError {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::OperationTimedOut,
        ) => LogError::Timeout(timeout),
        Some(
            RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::BrokerNotAvailable
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::NetworkException,
        ) => LogError::BrokerUnavailable(error.to_string()),
        Some(
            RDKafkaErrorCode::UnknownMemberId
            | RDKafkaErrorCode::IllegalGeneration
            | RDKafkaErrorCode::FencedInstanceId,
        ) => LogError::MembershipLost(error.to_string()),
        _ => LogError::Transport(error.to_string()),
    }
}
