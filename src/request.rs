//! Subscription descriptors and their connection-string rendering
//!
//! A [`SubscriptionDescriptor`] is what the caller asks for. The
//! [`SubscriptionRequestBuilder`] turns it into the `key=value;` string the
//! publisher parses plus the flags byte of the `Subscribe` command.
//!
//! ```rust
//! use feedline::request::{SubscriptionDescriptor, SubscriptionRequestBuilder};
//!
//! let descriptor =
//!     SubscriptionDescriptor::unsynchronized("FILTER ActiveMeasurements WHERE SignalType='FREQ'");
//! let request = SubscriptionRequestBuilder::default().build(&descriptor).unwrap();
//! assert!(request.connection_string.contains("includeTime=True"));
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::sink::{DownsamplingMethod, TimeAlignmentSettings};
use crate::types::{DataPacketFlags, OperationalEncoding, Ticks};
use crate::wire::text;
use crate::{Result, SubscriberError};

/// Frame settings shared by the two synchronized variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSettings {
    pub frames_per_second: u32,
    pub ignore_bad_timestamps: bool,
    pub allow_sorts_by_arrival: bool,
    /// Timestamp rounding resolution in ticks.
    pub time_resolution: i64,
    pub allow_preemptive_publishing: bool,
    pub downsampling_method: DownsamplingMethod,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            frames_per_second: 30,
            ignore_bad_timestamps: false,
            allow_sorts_by_arrival: true,
            time_resolution: Ticks::PER_MILLISECOND,
            allow_preemptive_publishing: true,
            downsampling_method: DownsamplingMethod::LastReceived,
        }
    }
}

/// Timing behavior of a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Synchronization {
    /// Measurements stream as they arrive at the publisher.
    Unsynchronized {
        #[serde(default)]
        throttled: bool,
        /// Seconds between throttled publications, `-1` for the lag time.
        #[serde(default = "default_publish_interval")]
        publish_interval: f64,
        #[serde(default = "default_true")]
        include_time: bool,
    },
    /// The publisher aligns measurements into frames.
    RemotelySynchronized(FrameSettings),
    /// Unsynchronized on the wire, aligned by a local sink.
    LocallySynchronized(FrameSettings),
}

impl Default for Synchronization {
    fn default() -> Self {
        Self::Unsynchronized { throttled: false, publish_interval: -1.0, include_time: true }
    }
}

fn default_publish_interval() -> f64 {
    -1.0
}

fn default_true() -> bool {
    true
}

/// What the caller wants to receive. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionDescriptor {
    /// Signal selector, e.g. `FILTER ActiveMeasurements WHERE SignalType='FREQ'`.
    pub filter_expression: String,
    pub compact_format: bool,
    pub synchronization: Synchronization,
    /// Seconds.
    pub lag_time: f64,
    /// Seconds.
    pub lead_time: f64,
    pub use_local_clock_as_real_time: bool,
    /// Milliseconds between publications, `-1` for the publisher default.
    pub processing_interval: i32,
    pub use_millisecond_resolution: bool,
    pub request_nan_value_filter: bool,
    pub start_time_constraint: Option<String>,
    pub stop_time_constraint: Option<String>,
    pub time_constraint_parameters: Option<String>,
    /// Appended verbatim to the rendered connection string.
    pub extra_connection_string_parameters: Option<String>,
    /// Local UDP port for a separate data channel.
    pub udp_data_channel_port: Option<u16>,
}

impl Default for SubscriptionDescriptor {
    fn default() -> Self {
        Self {
            filter_expression: String::new(),
            compact_format: true,
            synchronization: Synchronization::default(),
            lag_time: 10.0,
            lead_time: 5.0,
            use_local_clock_as_real_time: false,
            processing_interval: -1,
            use_millisecond_resolution: false,
            request_nan_value_filter: false,
            start_time_constraint: None,
            stop_time_constraint: None,
            time_constraint_parameters: None,
            extra_connection_string_parameters: None,
            udp_data_channel_port: None,
        }
    }
}

impl SubscriptionDescriptor {
    pub fn unsynchronized(filter_expression: impl Into<String>) -> Self {
        Self { filter_expression: filter_expression.into(), ..Self::default() }
    }

    pub fn remotely_synchronized(
        filter_expression: impl Into<String>,
        frames_per_second: u32,
    ) -> Self {
        Self {
            filter_expression: filter_expression.into(),
            synchronization: Synchronization::RemotelySynchronized(FrameSettings {
                frames_per_second,
                ..FrameSettings::default()
            }),
            ..Self::default()
        }
    }

    pub fn locally_synchronized(
        filter_expression: impl Into<String>,
        frames_per_second: u32,
    ) -> Self {
        Self {
            filter_expression: filter_expression.into(),
            synchronization: Synchronization::LocallySynchronized(FrameSettings {
                frames_per_second,
                ..FrameSettings::default()
            }),
            ..Self::default()
        }
    }

    pub fn with_udp_data_channel(mut self, port: u16) -> Self {
        self.udp_data_channel_port = Some(port);
        self
    }

    pub fn with_time_range(mut self, start: impl Into<String>, stop: impl Into<String>) -> Self {
        self.start_time_constraint = Some(start.into());
        self.stop_time_constraint = Some(stop.into());
        self
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self.synchronization, Synchronization::Unsynchronized { throttled: true, .. })
    }

    fn has_time_range(&self) -> bool {
        let set = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
        set(&self.start_time_constraint) || set(&self.stop_time_constraint)
    }
}

/// A rendered subscription ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    pub connection_string: String,
    /// Synchronized and compact bits of the `Subscribe` flags byte.
    pub flags: DataPacketFlags,
    /// Whether compact records embed their own timestamps.
    pub include_time: bool,
    pub use_millisecond_resolution: bool,
    pub throttled: bool,
    /// Seconds.
    pub lag_time: f64,
    pub data_channel_port: Option<u16>,
    /// Present for locally synchronized subscriptions.
    pub local_alignment: Option<TimeAlignmentSettings>,
}

impl SubscriptionRequest {
    /// `Subscribe` payload: flags byte, 4-byte length, encoded connection string.
    pub fn encode(&self, encoding: OperationalEncoding) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.connection_string.len() * 2);
        buf.put_u8(self.flags.value());
        text::put_sized_string(&mut buf, &self.connection_string, encoding);
        buf.freeze()
    }
}

/// Renders descriptors into connection strings.
#[derive(Debug, Clone)]
pub struct SubscriptionRequestBuilder {
    assembly_source: String,
    assembly_version: String,
}

impl Default for SubscriptionRequestBuilder {
    fn default() -> Self {
        Self {
            assembly_source: env!("CARGO_PKG_NAME").to_string(),
            assembly_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl SubscriptionRequestBuilder {
    pub fn new(assembly_source: impl Into<String>, assembly_version: impl Into<String>) -> Self {
        Self { assembly_source: assembly_source.into(), assembly_version: assembly_version.into() }
    }

    pub fn build(&self, descriptor: &SubscriptionDescriptor) -> Result<SubscriptionRequest> {
        validate(descriptor)?;

        match &descriptor.synchronization {
            Synchronization::Unsynchronized { throttled, publish_interval, include_time } => Ok(
                self.unsynchronized(descriptor, *throttled, *publish_interval, *include_time, None),
            ),
            Synchronization::RemotelySynchronized(frame) => {
                Ok(self.remotely_synchronized(descriptor, frame))
            }
            Synchronization::LocallySynchronized(frame) => {
                let time_range = descriptor.has_time_range();
                let alignment = TimeAlignmentSettings {
                    frames_per_second: frame.frames_per_second,
                    lag_time: descriptor.lag_time,
                    // Historical replay timestamps are expected to be far from real time.
                    lead_time: if time_range { f64::MAX } else { descriptor.lead_time },
                    use_local_clock_as_real_time: descriptor.use_local_clock_as_real_time,
                    ignore_bad_timestamps: frame.ignore_bad_timestamps,
                    allow_sorts_by_arrival: frame.allow_sorts_by_arrival,
                    time_resolution: Ticks(frame.time_resolution),
                    allow_preemptive_publishing: frame.allow_preemptive_publishing,
                    downsampling_method: frame.downsampling_method,
                    perform_timestamp_reasonability_check: !time_range,
                    processing_interval: descriptor.processing_interval,
                };
                let wire = SubscriptionDescriptor {
                    use_local_clock_as_real_time: false,
                    ..descriptor.clone()
                };
                Ok(self.unsynchronized(&wire, false, -1.0, true, Some(alignment)))
            }
        }
    }

    fn unsynchronized(
        &self,
        descriptor: &SubscriptionDescriptor,
        throttled: bool,
        publish_interval: f64,
        include_time: bool,
        local_alignment: Option<TimeAlignmentSettings>,
    ) -> SubscriptionRequest {
        let mut params = ConnectionString::default();
        params.push("trackLatestMeasurements", boolean(throttled));
        params.push("publishInterval", publish_interval);
        params.push("includeTime", boolean(include_time));
        params.push("lagTime", descriptor.lag_time);
        params.push("leadTime", descriptor.lead_time);
        params.push("useLocalClockAsRealTime", boolean(descriptor.use_local_clock_as_real_time));
        params.push("processingInterval", descriptor.processing_interval);
        params.push("useMillisecondResolution", boolean(descriptor.use_millisecond_resolution));
        params.push("requestNaNValueFilter", boolean(descriptor.request_nan_value_filter));
        params.push("assemblyInfo", self.assembly_info());
        push_common(&mut params, descriptor);

        SubscriptionRequest {
            connection_string: params.finish(),
            flags: DataPacketFlags::default()
                .with(DataPacketFlags::COMPACT, descriptor.compact_format),
            include_time,
            use_millisecond_resolution: descriptor.use_millisecond_resolution,
            throttled,
            lag_time: descriptor.lag_time,
            data_channel_port: descriptor.udp_data_channel_port,
            local_alignment,
        }
    }

    fn remotely_synchronized(
        &self,
        descriptor: &SubscriptionDescriptor,
        frame: &FrameSettings,
    ) -> SubscriptionRequest {
        let mut params = ConnectionString::default();
        params.push("framesPerSecond", frame.frames_per_second);
        params.push("lagTime", descriptor.lag_time);
        params.push("leadTime", descriptor.lead_time);
        // One frame timestamp per packet replaces per-measurement times.
        params.push("includeTime", boolean(false));
        params.push("useLocalClockAsRealTime", boolean(descriptor.use_local_clock_as_real_time));
        params.push("ignoreBadTimestamps", boolean(frame.ignore_bad_timestamps));
        params.push("allowSortsByArrival", boolean(frame.allow_sorts_by_arrival));
        params.push("timeResolution", frame.time_resolution);
        params.push("allowPreemptivePublishing", boolean(frame.allow_preemptive_publishing));
        params.push("requestNaNValueFilter", boolean(descriptor.request_nan_value_filter));
        params.push("downsamplingMethod", frame.downsampling_method);
        params.push("processingInterval", descriptor.processing_interval);
        params.push("assemblyInfo", self.assembly_info());
        push_common(&mut params, descriptor);

        SubscriptionRequest {
            connection_string: params.finish(),
            flags: DataPacketFlags::default()
                .with(DataPacketFlags::SYNCHRONIZED, true)
                .with(DataPacketFlags::COMPACT, descriptor.compact_format),
            include_time: false,
            use_millisecond_resolution: descriptor.use_millisecond_resolution,
            throttled: false,
            lag_time: descriptor.lag_time,
            data_channel_port: descriptor.udp_data_channel_port,
            local_alignment: None,
        }
    }

    fn assembly_info(&self) -> String {
        format!("{{source={};version={}}}", self.assembly_source, self.assembly_version)
    }
}

fn validate(descriptor: &SubscriptionDescriptor) -> Result<()> {
    if !descriptor.lag_time.is_finite() || descriptor.lag_time < 0.0 {
        return Err(SubscriberError::misuse(format!("invalid lag time {}", descriptor.lag_time)));
    }
    if !descriptor.lead_time.is_finite() || descriptor.lead_time < 0.0 {
        return Err(SubscriberError::misuse(format!("invalid lead time {}", descriptor.lead_time)));
    }
    match &descriptor.synchronization {
        Synchronization::RemotelySynchronized(frame) | Synchronization::LocallySynchronized(frame)
            if frame.frames_per_second == 0 =>
        {
            Err(SubscriberError::misuse("synchronized subscription requires frames per second > 0"))
        }
        _ => Ok(()),
    }
}

fn push_common(params: &mut ConnectionString, descriptor: &SubscriptionDescriptor) {
    if !descriptor.filter_expression.trim().is_empty() {
        params.push("inputMeasurementKeys", format!("{{{}}}", descriptor.filter_expression));
    }
    if let Some(port) = descriptor.udp_data_channel_port {
        params.push("dataChannel", format!("{{localport={port}}}"));
    }
    if let Some(start) = non_empty(&descriptor.start_time_constraint) {
        params.push("startTimeConstraint", start);
    }
    if let Some(stop) = non_empty(&descriptor.stop_time_constraint) {
        params.push("stopTimeConstraint", stop);
    }
    if let Some(parameters) = non_empty(&descriptor.time_constraint_parameters) {
        params.push("timeConstraintParameters", parameters);
    }
    if let Some(extra) = non_empty(&descriptor.extra_connection_string_parameters) {
        params.raw(extra);
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn boolean(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

#[derive(Default)]
struct ConnectionString {
    buf: String,
}

impl ConnectionString {
    fn push(&mut self, key: &str, value: impl std::fmt::Display) {
        use std::fmt::Write;
        let _ = write!(self.buf, "{key}={value};");
    }

    fn raw(&mut self, fragment: &str) {
        self.buf.push_str(fragment);
        if !fragment.ends_with(';') {
            self.buf.push(';');
        }
    }

    fn finish(self) -> String {
        self.buf
    }
}

/// Reads a `key=value;` connection string back into pairs.
///
/// Nested `{...}` values are kept intact. Keys are case-insensitive.
pub fn parse_connection_string(input: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    let mut push_segment = |segment: &str| {
        if let Some((key, value)) = segment.split_once('=') {
            let value = value.trim();
            let value = value.strip_prefix('{').and_then(|v| v.strip_suffix('}')).unwrap_or(value);
            pairs.push((key.trim().to_ascii_lowercase(), value.to_string()));
        }
    };

    for (i, c) in input.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            ';' if depth == 0 => {
                push_segment(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    push_segment(&input[start..]);
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn params(request: &SubscriptionRequest) -> HashMap<String, String> {
        parse_connection_string(&request.connection_string).into_iter().collect()
    }

    #[test]
    fn unsynchronized_renders_timing_and_filter() {
        let filter = "FILTER ActiveMeasurements WHERE SignalType='FREQ'";
        let descriptor = SubscriptionDescriptor::unsynchronized(filter);
        let request =
            SubscriptionRequestBuilder::new("feedline", "1.2.3").build(&descriptor).unwrap();
        let p = params(&request);

        assert_eq!(p["tracklatestmeasurements"], "False");
        assert_eq!(p["includetime"], "True");
        assert_eq!(p["lagtime"], "10");
        assert_eq!(p["leadtime"], "5");
        assert_eq!(p["publishinterval"], "-1");
        assert_eq!(p["inputmeasurementkeys"], "FILTER ActiveMeasurements WHERE SignalType='FREQ'");
        assert_eq!(p["assemblyinfo"], "source=feedline;version=1.2.3");
        assert!(!request.flags.is_synchronized());
        assert!(request.flags.is_compact());
        assert!(request.include_time);
    }

    #[test]
    fn remote_synchronized_never_embeds_time() {
        let descriptor = SubscriptionDescriptor::remotely_synchronized("PPA:1", 30);
        let request = SubscriptionRequestBuilder::default().build(&descriptor).unwrap();
        let p = params(&request);

        assert_eq!(p["framespersecond"], "30");
        assert_eq!(p["includetime"], "False");
        assert_eq!(p["downsamplingmethod"], "LastReceived");
        assert_eq!(p["allowsortsbyarrival"], "True");
        assert!(request.flags.is_synchronized());
        assert!(!request.include_time);
        assert!(request.local_alignment.is_none());
    }

    #[test]
    fn local_synchronized_degrades_to_unsynchronized_with_alignment() {
        let descriptor = SubscriptionDescriptor {
            use_local_clock_as_real_time: true,
            ..SubscriptionDescriptor::locally_synchronized("PPA:1", 60)
        };
        let request = SubscriptionRequestBuilder::default().build(&descriptor).unwrap();
        let p = params(&request);

        assert!(!request.flags.is_synchronized());
        assert_eq!(p["includetime"], "True");
        assert_eq!(p["uselocalclockasrealtime"], "False");
        assert!(!p.contains_key("framespersecond"));

        let alignment = request.local_alignment.as_ref().unwrap();
        assert_eq!(alignment.frames_per_second, 60);
        assert!(alignment.use_local_clock_as_real_time);
        assert!(alignment.perform_timestamp_reasonability_check);
        assert_eq!(alignment.lead_time, 5.0);
    }

    #[test]
    fn local_synchronized_replay_disables_reasonability_checks() {
        let descriptor = SubscriptionDescriptor::locally_synchronized("PPA:1", 30)
            .with_time_range("2024-01-01 00:00:00", "2024-01-01 01:00:00");
        let request = SubscriptionRequestBuilder::default().build(&descriptor).unwrap();
        let alignment = request.local_alignment.as_ref().unwrap();
        assert!(!alignment.perform_timestamp_reasonability_check);
        assert_eq!(alignment.lead_time, f64::MAX);

        let p = params(&request);
        assert_eq!(p["starttimeconstraint"], "2024-01-01 00:00:00");
        assert_eq!(p["stoptimeconstraint"], "2024-01-01 01:00:00");
    }

    #[test]
    fn data_channel_and_extra_parameters_are_appended() {
        let descriptor = SubscriptionDescriptor {
            extra_connection_string_parameters: Some("customKey=42".to_string()),
            ..SubscriptionDescriptor::unsynchronized("PPA:1").with_udp_data_channel(9600)
        };
        let request = SubscriptionRequestBuilder::default().build(&descriptor).unwrap();
        let p = params(&request);
        assert_eq!(p["datachannel"], "localport=9600");
        assert_eq!(p["customkey"], "42");
        assert_eq!(request.data_channel_port, Some(9600));
    }

    #[test]
    fn invalid_descriptors_are_rejected_before_rendering() {
        let zero_fps = SubscriptionDescriptor::remotely_synchronized("PPA:1", 0);
        assert!(matches!(
            SubscriptionRequestBuilder::default().build(&zero_fps),
            Err(SubscriberError::Misuse { .. })
        ));

        let negative_lag =
            SubscriptionDescriptor { lag_time: -1.0, ..SubscriptionDescriptor::default() };
        assert!(SubscriptionRequestBuilder::default().build(&negative_lag).is_err());
    }

    #[test]
    fn encoded_payload_has_flags_length_and_text() {
        let descriptor = SubscriptionDescriptor::remotely_synchronized("PPA:1", 30);
        let request = SubscriptionRequestBuilder::default().build(&descriptor).unwrap();
        let payload = request.encode(OperationalEncoding::Utf8);

        assert_eq!(payload[0], DataPacketFlags::SYNCHRONIZED | DataPacketFlags::COMPACT);
        let len = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]) as usize;
        assert_eq!(len, request.connection_string.len());
        assert_eq!(&payload[5..], request.connection_string.as_bytes());
    }

    #[test]
    fn descriptor_deserializes_from_yaml() {
        let yaml = r#"
filter_expression: "FILTER ActiveMeasurements WHERE SignalType='FREQ'"
synchronization:
  mode: unsynchronized
  throttled: true
  publish_interval: 1.0
lag_time: 3.0
"#;
        let descriptor: SubscriptionDescriptor = serde_yaml_ng::from_str(yaml).unwrap();
        assert!(descriptor.is_throttled());
        assert!(descriptor.compact_format);
        assert_eq!(descriptor.lag_time, 3.0);
    }
}
