//! Weather service fixture
//!
//! A small API touching every method policy, and a typed client wrapping
//! the engine the way an application would.

use courier_core::{
    ApiSpec, CachePolicy, CallHandle, CallOptions, Engine, FallbackMode, MethodRef, MethodSpec,
    PersistenceLevel, Result, ReturnShape, SingleFlightMode,
};
use serde_json::json;

/// Interface name of the weather API
pub const WEATHER: &str = "WeatherService";

/// Weather API with wire names prefixed `weather.`
///
/// - `currentTemperature`: synchronous, uncached
/// - `forecast`: cached for one minute, named parameters `city`, `days`
/// - `alerts`: single-flight, a new call replaces the one in flight
/// - `stations`: durable cache, falls back on connection errors
/// - `report`: returns nothing
pub fn weather_api() -> ApiSpec {
    ApiSpec::new(WEATHER)
        .prefix("weather.")
        .method(MethodSpec::synchronous("currentTemperature").signature("String"))
        .method(
            MethodSpec::asynchronous("forecast")
                .signature("String,u32")
                .param_names(["city", "days"])
                .cache(CachePolicy::new().ttl_ms(60_000)),
        )
        .method(
            MethodSpec::asynchronous("alerts")
                .signature("String")
                .single_flight(SingleFlightMode::CancelOld),
        )
        .method(
            MethodSpec::asynchronous("stations").cache(
                CachePolicy::new()
                    .persistence(PersistenceLevel::Durable)
                    .fallback(FallbackMode::OnConnectionError),
            ),
        )
        .method(
            MethodSpec::asynchronous("report")
                .signature("String,String")
                .returns(ReturnShape::Unit),
        )
}

/// Typed facade over an engine with [`weather_api`] registered
#[derive(Debug, Clone)]
pub struct WeatherClient {
    engine: Engine,
    current_temperature: MethodRef,
    forecast: MethodRef,
    alerts: MethodRef,
    stations: MethodRef,
    report: MethodRef,
}

impl WeatherClient {
    /// Look up every weather method on `engine`
    pub fn new(engine: &Engine) -> Result<Self> {
        Ok(Self {
            engine: engine.clone(),
            current_temperature: engine.method(WEATHER, "currentTemperature")?,
            forecast: engine.method(WEATHER, "forecast")?,
            alerts: engine.method(WEATHER, "alerts")?,
            stations: engine.method(WEATHER, "stations")?,
            report: engine.method(WEATHER, "report")?,
        })
    }

    /// Current temperature in `city`, fetched inline
    pub async fn current_temperature(&self, city: &str) -> Result<f64> {
        self.engine
            .call_typed(&self.current_temperature, vec![json!(city)])
            .await
    }

    /// Forecast for `city` over `days`
    pub fn forecast(&self, city: &str, days: u32, options: CallOptions) -> Result<CallHandle> {
        self.engine
            .submit(&self.forecast, vec![json!(city), json!(days)], options)
    }

    /// Active alerts for `region`
    pub fn alerts(&self, region: &str, options: CallOptions) -> Result<CallHandle> {
        self.engine.submit(&self.alerts, vec![json!(region)], options)
    }

    /// Station list
    pub fn stations(&self, options: CallOptions) -> Result<CallHandle> {
        self.engine.submit(&self.stations, Vec::new(), options)
    }

    /// Submit an observation for `city`
    pub fn report(&self, city: &str, observation: &str, options: CallOptions) -> Result<CallHandle> {
        self.engine
            .submit(&self.report, vec![json!(city), json!(observation)], options)
    }

    /// Method handles, for batching
    pub fn forecast_method(&self) -> &MethodRef {
        &self.forecast
    }

    /// See [`forecast_method`](Self::forecast_method)
    pub fn stations_method(&self) -> &MethodRef {
        &self.stations
    }
}
