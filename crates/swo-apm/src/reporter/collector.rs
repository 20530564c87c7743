//! Collector wire protocol: message types and the gRPC client for the four
//! RPCs (settings fetch, event, status and metrics submission).

use std::time::Duration;

use crate::oboe::settings::{
	DEFAULT_EVENTS_FLUSH_INTERVAL, DEFAULT_MAX_TRANSACTIONS, DEFAULT_METRICS_FLUSH_INTERVAL,
	SettingArgs, SettingFlags, SettingType,
};

#[cfg(test)]
#[path = "collector_tests.rs"]
mod tests;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum ResultCode {
	Ok = 0,
	TryLater = 1,
	LimitExceeded = 2,
	InvalidApiKey = 3,
	Redirect = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HostId {
	#[prost(string, tag = "1")]
	pub hostname: String,
	#[prost(int32, tag = "2")]
	pub pid: i32,
	#[prost(string, tag = "3")]
	pub host_alias: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MessageRequest {
	#[prost(string, tag = "1")]
	pub api_key: String,
	#[prost(bytes = "vec", repeated, tag = "2")]
	pub messages: Vec<Vec<u8>>,
	#[prost(message, optional, tag = "3")]
	pub identity: Option<HostId>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MessageResult {
	#[prost(enumeration = "ResultCode", tag = "1")]
	pub result: i32,
	#[prost(string, tag = "2")]
	pub arg: String,
	#[prost(string, tag = "3")]
	pub warning: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SettingsRequest {
	#[prost(string, tag = "1")]
	pub api_key: String,
	#[prost(message, optional, tag = "2")]
	pub identity: Option<HostId>,
	#[prost(string, tag = "3")]
	pub client_version: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OboeSetting {
	#[prost(int32, tag = "1")]
	pub setting_type: i32,
	#[prost(string, tag = "2")]
	pub flags: String,
	#[prost(int64, tag = "3")]
	pub timestamp: i64,
	#[prost(int64, tag = "4")]
	pub value: i64,
	#[prost(string, tag = "5")]
	pub layer: String,
	#[prost(map = "string, bytes", tag = "6")]
	pub arguments: std::collections::HashMap<String, Vec<u8>>,
	#[prost(int64, tag = "7")]
	pub ttl: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SettingsResult {
	#[prost(enumeration = "ResultCode", tag = "1")]
	pub result: i32,
	#[prost(string, tag = "2")]
	pub arg: String,
	#[prost(message, repeated, tag = "3")]
	pub settings: Vec<OboeSetting>,
	#[prost(string, tag = "4")]
	pub warning: String,
}

impl MessageResult {
	pub fn code(&self) -> ResultCode {
		ResultCode::try_from(self.result).unwrap_or(ResultCode::Ok)
	}
}

impl SettingsResult {
	pub fn code(&self) -> ResultCode {
		ResultCode::try_from(self.result).unwrap_or(ResultCode::Ok)
	}
}

const SETTING_TYPE_DEFAULT: i32 = 0;
const SETTING_TYPE_LAYER: i32 = 1;

// Argument-map keys carried by `OboeSetting`.
const ARG_BUCKET_CAPACITY: &str = "BucketCapacity";
const ARG_BUCKET_RATE: &str = "BucketRate";
const ARG_RELAXED_CAPACITY: &str = "TriggerRelaxedBucketCapacity";
const ARG_RELAXED_RATE: &str = "TriggerRelaxedBucketRate";
const ARG_STRICT_CAPACITY: &str = "TriggerStrictBucketCapacity";
const ARG_STRICT_RATE: &str = "TriggerStrictBucketRate";
const ARG_SIGNATURE_KEY: &str = "SignatureKey";
const ARG_METRICS_FLUSH_INTERVAL: &str = "MetricsFlushInterval";
const ARG_EVENTS_FLUSH_INTERVAL: &str = "EventsFlushInterval";
const ARG_MAX_TRANSACTIONS: &str = "MaxTransactions";

impl OboeSetting {
	/// Decode the wire form into plain setting values. Numeric arguments
	/// are little-endian encoded; anything missing or short falls back to
	/// its default.
	pub fn to_args(&self) -> SettingArgs {
		let setting_type = if self.setting_type == SETTING_TYPE_LAYER && !self.layer.is_empty() {
			SettingType::Layer(self.layer.clone())
		} else if self.setting_type == SETTING_TYPE_DEFAULT {
			SettingType::Default
		} else {
			SettingType::Layer(self.layer.clone())
		};
		SettingArgs {
			setting_type,
			flags: SettingFlags::parse(&self.flags),
			sample_rate: self.value.clamp(0, i32::MAX as i64) as i32,
			ttl: Duration::from_secs(self.ttl.max(0) as u64),
			bucket_capacity: self.arg_f64(ARG_BUCKET_CAPACITY).unwrap_or_default(),
			bucket_rate: self.arg_f64(ARG_BUCKET_RATE).unwrap_or_default(),
			tt_relaxed_capacity: self.arg_f64(ARG_RELAXED_CAPACITY).unwrap_or_default(),
			tt_relaxed_rate: self.arg_f64(ARG_RELAXED_RATE).unwrap_or_default(),
			tt_strict_capacity: self.arg_f64(ARG_STRICT_CAPACITY).unwrap_or_default(),
			tt_strict_rate: self.arg_f64(ARG_STRICT_RATE).unwrap_or_default(),
			signature_token: self
				.arguments
				.get(ARG_SIGNATURE_KEY)
				.cloned()
				.unwrap_or_default(),
			metrics_flush_interval: self
				.arg_i32(ARG_METRICS_FLUSH_INTERVAL)
				.filter(|v| *v > 0)
				.map(|v| Duration::from_secs(v as u64))
				.unwrap_or(DEFAULT_METRICS_FLUSH_INTERVAL),
			events_flush_interval: self
				.arg_i32(ARG_EVENTS_FLUSH_INTERVAL)
				.filter(|v| *v > 0)
				.map(|v| Duration::from_secs(v as u64))
				.unwrap_or(DEFAULT_EVENTS_FLUSH_INTERVAL),
			max_transactions: self
				.arg_i32(ARG_MAX_TRANSACTIONS)
				.filter(|v| *v > 0)
				.map(|v| v as usize)
				.unwrap_or(DEFAULT_MAX_TRANSACTIONS),
		}
	}

	fn arg_f64(&self, key: &str) -> Option<f64> {
		let bytes = self.arguments.get(key)?;
		Some(f64::from_le_bytes(bytes.as_slice().try_into().ok()?))
	}

	fn arg_i32(&self, key: &str) -> Option<i32> {
		let bytes = self.arguments.get(key)?;
		Some(i32::from_le_bytes(bytes.as_slice().try_into().ok()?))
	}
}

pub mod trace_collector_client {
	#![allow(unused_variables, dead_code)]

	use tonic::codegen::http::Uri;
	use tonic::codegen::*;

	/// Client for the collector service, kept in step with its proto
	/// definition.
	#[derive(Debug, Clone)]
	pub struct TraceCollectorClient<T> {
		inner: tonic::client::Grpc<T>,
	}

	impl TraceCollectorClient<tonic::transport::Channel> {
		pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
		where
			D: TryInto<tonic::transport::Endpoint>,
			D::Error: Into<StdError>,
		{
			let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
			Ok(Self::new(conn))
		}
	}

	impl<T> TraceCollectorClient<T>
	where
		T: tonic::client::GrpcService<tonic::body::Body>,
		T::Error: Into<StdError>,
		T::ResponseBody: Body<Data = Bytes> + Send + 'static,
		<T::ResponseBody as Body>::Error: Into<StdError> + Send,
	{
		pub fn new(inner: T) -> Self {
			let inner = tonic::client::Grpc::new(inner);
			Self { inner }
		}

		pub fn with_origin(inner: T, origin: Uri) -> Self {
			let inner = tonic::client::Grpc::with_origin(inner, origin);
			Self { inner }
		}

		pub async fn get_settings(
			&mut self,
			request: impl tonic::IntoRequest<super::SettingsRequest>,
		) -> Result<tonic::Response<super::SettingsResult>, tonic::Status> {
			self.unary(request, "getSettings").await
		}

		pub async fn post_events(
			&mut self,
			request: impl tonic::IntoRequest<super::MessageRequest>,
		) -> Result<tonic::Response<super::MessageResult>, tonic::Status> {
			self.unary(request, "postEvents").await
		}

		pub async fn post_metrics(
			&mut self,
			request: impl tonic::IntoRequest<super::MessageRequest>,
		) -> Result<tonic::Response<super::MessageResult>, tonic::Status> {
			self.unary(request, "postMetrics").await
		}

		pub async fn post_status(
			&mut self,
			request: impl tonic::IntoRequest<super::MessageRequest>,
		) -> Result<tonic::Response<super::MessageResult>, tonic::Status> {
			self.unary(request, "postStatus").await
		}

		async fn unary<Req, Rsp>(
			&mut self,
			request: impl tonic::IntoRequest<Req>,
			method: &'static str,
		) -> Result<tonic::Response<Rsp>, tonic::Status>
		where
			Req: prost::Message + Default + 'static,
			Rsp: prost::Message + Default + 'static,
		{
			self.inner.ready().await.map_err(|e| {
				tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
			})?;
			let codec = tonic_prost::ProstCodec::default();
			let path = http::uri::PathAndQuery::from_maybe_shared(format!(
				"/collector.TraceCollector/{method}"
			))
			.map_err(|e| tonic::Status::internal(format!("invalid rpc path: {e}")))?;
			let mut req = request.into_request();
			req
				.extensions_mut()
				.insert(GrpcMethod::new("collector.TraceCollector", method));
			self.inner.unary(req, path, codec).await
		}
	}
}

pub use trace_collector_client::TraceCollectorClient;
