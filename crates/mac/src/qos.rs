//! QoS parameter resolution
//!
//! Station classes carry fixed defaults. Applications that declare a
//! constant or variable bit rate get parameters derived from their packet
//! size and interval instead.

use std::collections::HashMap;
use std::time::Duration;

use wimax_core::{AppProfile, QosParameters, ServiceType, StationClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedQos {
    pub params: QosParameters,
    pub class: StationClass,
    pub service_type: ServiceType,
    /// Set by VBR sources, whose classifier is keyed on their port.
    pub source_port: Option<u16>,
}

pub fn default_tos_map() -> Vec<(u8, ServiceType)> {
    use ServiceType::*;
    vec![
        (0, Be),
        (8, NrtPs),
        (10, NrtPs),
        (12, NrtPs),
        (14, NrtPs),
        (16, NrtPs),
        (18, NrtPs),
        (20, NrtPs),
        (22, NrtPs),
        (24, RtPs),
        (26, RtPs),
        (28, RtPs),
        (30, RtPs),
        (32, ErtPs),
        (34, ErtPs),
        (36, ErtPs),
        (38, ErtPs),
        (40, Ugs),
        (48, NrtPs),
        (56, Ugs),
    ]
}

fn class_params(class: StationClass) -> QosParameters {
    let (min_pkt, max_pkt, sustained, reserved, latency_ms, jitter_us) = match class {
        StationClass::Gold => (1024, 1024, 500_000, 200_000, 30, 100),
        StationClass::Silver => (1024, 512, 200_000, 500_000, 100, 300),
        StationClass::Bronze => (256, 256, 800, 800, 100, 100),
        _ => (1024, 512, 100_000, 100_000, 150, 1000),
    };
    QosParameters {
        priority: 0,
        min_pkt_size: min_pkt,
        max_pkt_size: max_pkt,
        max_sustained_rate: sustained,
        min_reserved_rate: reserved,
        max_latency: Duration::from_millis(latency_ms),
        tolerated_jitter: Duration::from_micros(jitter_us),
    }
}

fn rate_for(size: u32, interval: Duration) -> u32 {
    if interval.is_zero() {
        return u32::MAX;
    }
    let bps = (size as f64 * 8.0) / interval.as_secs_f64();
    bps.min(u32::MAX as f64) as u32
}

#[derive(Debug, Clone)]
pub struct QosResolver {
    class: StationClass,
    tos_map: HashMap<u8, ServiceType>,
}

impl QosResolver {
    pub fn new(class: StationClass, tos_map: &[(u8, ServiceType)]) -> Self {
        Self { class, tos_map: tos_map.iter().copied().collect() }
    }

    pub fn class_defaults(&self) -> QosParameters {
        class_params(self.class)
    }

    /// Scheduling service for a raw ToS byte; the map is keyed on the DSCP.
    pub fn service_type(&self, tos: u8) -> ServiceType {
        self.tos_map.get(&(tos >> 2)).copied().unwrap_or(ServiceType::Be)
    }

    pub fn resolve(&self, tos: u8, app: AppProfile, payload_size: u32) -> ResolvedQos {
        let service_type = self.service_type(tos);
        let mut params = class_params(self.class);
        params.priority = tos >> 5;

        let (interval, source_port) = match app {
            AppProfile::Unknown => {
                return ResolvedQos { params, class: self.class, service_type, source_port: None };
            }
            AppProfile::Cbr { interval } => (interval, None),
            AppProfile::Vbr { mean_interval, source_port } => (mean_interval, Some(source_port)),
        };

        params.min_pkt_size = payload_size;
        params.max_pkt_size = payload_size;
        params.max_sustained_rate = rate_for(payload_size, interval);
        params.min_reserved_rate = params.max_sustained_rate;
        params.max_latency = interval;
        params.tolerated_jitter = Duration::ZERO;

        ResolvedQos { params, class: StationClass::AppSpecified, service_type, source_port }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(class: StationClass) -> QosResolver {
        QosResolver::new(class, &default_tos_map())
    }

    #[test]
    fn test_station_class_tables() {
        let gold = resolver(StationClass::Gold).class_defaults();
        assert_eq!(gold.max_sustained_rate, 500_000);
        assert_eq!(gold.max_latency, Duration::from_millis(30));

        let bronze = resolver(StationClass::Bronze).class_defaults();
        assert_eq!((bronze.min_pkt_size, bronze.max_pkt_size), (256, 256));

        let fallback = resolver(StationClass::Unknown).class_defaults();
        assert_eq!(fallback, resolver(StationClass::Default).class_defaults());
        assert_eq!(fallback.tolerated_jitter, Duration::from_micros(1000));
    }

    #[test]
    fn test_cbr_hint_overrides_class() {
        let r = resolver(StationClass::Silver);
        let q = r.resolve(0, AppProfile::Cbr { interval: Duration::from_millis(20) }, 160);
        assert_eq!(q.class, StationClass::AppSpecified);
        assert_eq!(q.params.max_sustained_rate, 64_000);
        assert_eq!(q.params.min_reserved_rate, 64_000);
        assert_eq!(q.params.max_latency, Duration::from_millis(20));
        assert_eq!(q.params.tolerated_jitter, Duration::ZERO);
        assert_eq!(q.source_port, None);

        let v = r.resolve(0, AppProfile::Vbr { mean_interval: Duration::from_secs(1), source_port: 4000 }, 500);
        assert_eq!(v.params.max_sustained_rate, 4000);
        assert_eq!(v.source_port, Some(4000));
    }

    #[test]
    fn test_tos_to_service() {
        let r = resolver(StationClass::Default);
        assert_eq!(r.service_type(0), ServiceType::Be);
        assert_eq!(r.service_type(46 << 2), ServiceType::Be);
        assert_eq!(r.service_type(40 << 2), ServiceType::Ugs);
        assert_eq!(r.service_type(34 << 2), ServiceType::ErtPs);
        assert_eq!(r.service_type(26 << 2), ServiceType::RtPs);
        assert_eq!(r.service_type(48 << 2), ServiceType::NrtPs);
        // ECN bits are ignored
        assert_eq!(r.service_type((56 << 2) | 0x3), ServiceType::Ugs);
    }
}
