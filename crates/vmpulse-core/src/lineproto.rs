//! InfluxDB line protocol encoding.
//!
//! `measurement,tag=v,... field=v,... <ts_ns>` with ns-precision epoch
//! timestamps. Tag values escape backslash, space, comma and equals;
//! integer fields carry the `i` suffix; non-finite floats serialize as `0`.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::sample::{DerivedSample, RawSample, VmIdentity};

/// A typed field value for one line-protocol record. Every counter the
/// pipeline emits is either a raw integer or a derived float.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
}

/// Escape a tag key or value.
pub fn escape_tag(v: &str) -> String {
    v.replace('\\', "\\\\")
        .replace(' ', "\\ ")
        .replace(',', "\\,")
        .replace('=', "\\=")
}

fn format_field_value(v: &FieldValue) -> String {
    match v {
        FieldValue::Integer(i) => format!("{i}i"),
        FieldValue::Float(f) if !f.is_finite() => "0".to_string(),
        FieldValue::Float(f) => format!("{f}"),
    }
}

/// Nanoseconds since the Unix epoch for a timestamp.
pub fn timestamp_ns(ts: SystemTime) -> i64 {
    ts.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Build one line-protocol record.
///
/// Tags with empty values are omitted. A record whose field set is empty
/// gets a `noop=0i` placeholder so the line stays parseable.
pub fn line(
    measurement: &str,
    tags: &[(&str, &str)],
    fields: &[(&str, FieldValue)],
    ts: SystemTime,
) -> String {
    let tag_str = tags
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{}={}", escape_tag(k), escape_tag(v)))
        .collect::<Vec<_>>()
        .join(",");

    let field_str = if fields.is_empty() {
        "noop=0i".to_string()
    } else {
        fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, format_field_value(v)))
            .collect::<Vec<_>>()
            .join(",")
    };

    let t_ns = timestamp_ns(ts);
    if tag_str.is_empty() {
        format!("{measurement} {field_str} {t_ns}")
    } else {
        format!("{measurement},{tag_str} {field_str} {t_ns}")
    }
}

fn vm_tags<'a>(vm: &'a VmIdentity, vmid: &'a str, device: Option<&'a str>) -> Vec<(&'a str, &'a str)> {
    let mut tags = vec![("vmid", vmid), ("uuid", vm.uuid.as_str()), ("name", vm.name.as_str())];
    if let Some(dev) = device {
        tags.push(("device", dev));
    }
    tags
}

/// Encode one raw counter sample.
pub fn encode_raw_sample(vm: &VmIdentity, sample: &RawSample) -> String {
    let vmid = vm.id.to_string();
    let tags = vm_tags(vm, &vmid, sample.device.as_deref());
    let fields: Vec<(&str, FieldValue)> = sample
        .fields
        .iter()
        .map(|&(f, v)| (f.name(), FieldValue::Integer(v as i64)))
        .collect();
    line(sample.measurement.wire_name(), &tags, &fields, sample.timestamp)
}

/// Encode one derived rate feature as a `vm_features` record.
pub fn encode_derived_sample(vm: &VmIdentity, derived: &DerivedSample) -> String {
    let vmid = vm.id.to_string();
    let tags = vm_tags(vm, &vmid, None);
    let rate_key = format!("{}_rate", derived.field.name());
    let angle_key = format!("{}_activity_deg", derived.field.name());
    let fields = [
        (rate_key.as_str(), FieldValue::Float(derived.rate)),
        (angle_key.as_str(), FieldValue::Float(derived.activity_deg)),
    ];
    line("vm_features", &tags, &fields, derived.timestamp)
}

/// Encode the per-cycle latency record (no VM tags).
pub fn encode_latency(feature_ms: f64, loop_ms: f64, ts: SystemTime) -> String {
    let fields = [
        ("feature_latency_ms", FieldValue::Float(feature_ms)),
        ("loop_latency_ms", FieldValue::Float(loop_ms)),
    ];
    line("collector_latency", &[], &fields, ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{CounterField, Measurement};
    use std::time::Duration;

    fn ts_at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn test_vm() -> VmIdentity {
        VmIdentity {
            id: 7,
            name: "web-01".to_string(),
            uuid: "aaaa-bbbb".to_string(),
            vcpu_count: 2,
            memory_max_kb: 2_097_152,
        }
    }

    #[test]
    fn test_escape_tag() {
        assert_eq!(escape_tag("plain"), "plain");
        assert_eq!(escape_tag("a b"), "a\\ b");
        assert_eq!(escape_tag("a,b=c"), "a\\,b\\=c");
        assert_eq!(escape_tag("back\\slash"), "back\\\\slash");
    }

    #[test]
    fn test_field_value_formatting() {
        assert_eq!(format_field_value(&FieldValue::Integer(42)), "42i");
        assert_eq!(format_field_value(&FieldValue::Integer(-3)), "-3i");
        assert_eq!(format_field_value(&FieldValue::Float(1.5)), "1.5");
        assert_eq!(format_field_value(&FieldValue::Float(f64::NAN)), "0");
        assert_eq!(format_field_value(&FieldValue::Float(f64::INFINITY)), "0");
    }

    #[test]
    fn test_line_basic() {
        let l = line(
            "m",
            &[("host", "a b")],
            &[("v", FieldValue::Integer(1))],
            ts_at(10),
        );
        assert_eq!(l, "m,host=a\\ b v=1i 10000000000");
    }

    #[test]
    fn test_line_no_tags_and_empty_fields() {
        let l = line("m", &[], &[], ts_at(1));
        assert_eq!(l, "m noop=0i 1000000000");
    }

    #[test]
    fn test_line_skips_empty_tag_values() {
        let l = line(
            "m",
            &[("uuid", ""), ("name", "x")],
            &[("v", FieldValue::Integer(0))],
            ts_at(1),
        );
        assert_eq!(l, "m,name=x v=0i 1000000000");
    }

    #[test]
    fn test_encode_raw_sample() {
        let vm = test_vm();
        let sample = RawSample {
            vm_id: vm.id,
            measurement: Measurement::Network,
            device: Some("tap0".to_string()),
            fields: vec![
                (CounterField::NetRxBytes, 100),
                (CounterField::NetTxBytes, 200),
            ],
            timestamp: ts_at(5),
        };
        let l = encode_raw_sample(&vm, &sample);
        assert_eq!(
            l,
            "vm_network,vmid=7,uuid=aaaa-bbbb,name=web-01,device=tap0 \
             net_rx_bytes=100i,net_tx_bytes=200i 5000000000"
        );
    }

    #[test]
    fn test_encode_derived_sample() {
        let vm = test_vm();
        let derived = DerivedSample {
            vm_id: vm.id,
            field: CounterField::MemUsedKb,
            rate: 21239.5,
            activity_deg: 77.0,
            timestamp: ts_at(5),
        };
        let l = encode_derived_sample(&vm, &derived);
        assert!(l.starts_with("vm_features,vmid=7,uuid=aaaa-bbbb,name=web-01 "));
        assert!(l.contains("mem_used_kb_rate=21239.5"));
        assert!(l.contains("mem_used_kb_activity_deg=77"));
    }

    #[test]
    fn test_encode_latency() {
        let l = encode_latency(0.25, 3.5, ts_at(2));
        assert_eq!(
            l,
            "collector_latency feature_latency_ms=0.25,loop_latency_ms=3.5 2000000000"
        );
    }
}
