use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::warn;
use uuid::Uuid;

use crate::diff::diff_points;
use crate::types::{DevicePoint, PointValues};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogMode {
    Full,
    Diffed,
}

pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
    baselines: HashMap<String, PointValues>,
}

fn entry(dir: &str, rid: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("ts".into(), json!(Utc::now().to_rfc3339()));
    map.insert("dir".into(), json!(dir));
    map.insert("rid".into(), json!(rid));
    map
}

fn values_object(values: &PointValues) -> Value {
    let map: Map<String, Value> = values
        .iter()
        .map(|(id, v)| (id.to_string(), json!(v)))
        .collect();
    Value::Object(map)
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            mode,
            file,
            baselines: HashMap::new(),
        })
    }

    pub fn log_request(&mut self, method: &str, path: &str, body: Option<&Value>) -> String {
        let rid = Uuid::new_v4().to_string();
        let mut line = entry("req", &rid);
        line.insert("method".into(), json!(method));
        line.insert("path".into(), json!(path));
        line.insert("body".into(), json!(body));
        self.write_line(line);
        rid
    }

    pub fn log_write(&mut self, rid: &str, device_id: &str, values: &PointValues, status: u16) {
        let mut line = entry("write", rid);
        line.insert("device".into(), json!(device_id));
        line.insert("status".into(), json!(status));
        line.insert("values".into(), values_object(values));
        self.write_line(line);
    }

    pub fn log_error(&mut self, rid: &str, error: &str) {
        let mut line = entry("err", rid);
        line.insert("error".into(), json!(error));
        self.write_line(line);
    }

    pub fn log_points(&mut self, rid: &str, device_id: &str, points: &[DevicePoint]) {
        let read: PointValues = points.iter().map(|p| (p.id, p.value)).collect();
        let mut line = entry("read", rid);
        line.insert("device".into(), json!(device_id));

        let baseline = match self.mode {
            MessageLogMode::Full => None,
            MessageLogMode::Diffed => self.baselines.get(device_id),
        };
        match baseline {
            Some(previous) => {
                let changes: Vec<Value> = diff_points(previous, &read)
                    .into_iter()
                    .map(|c| json!({ "id": c.id.0, "old": c.old, "new": c.new }))
                    .collect();
                line.insert("changes".into(), Value::Array(changes));
            }
            None => {
                if self.mode == MessageLogMode::Diffed {
                    line.insert("full".into(), json!(true));
                }
                line.insert("body".into(), json!({ "points": values_object(&read) }));
            }
        }
        self.write_line(line);

        // Reads cover different register subsets, so the baseline accumulates.
        if self.mode == MessageLogMode::Diffed {
            self.baselines
                .entry(device_id.to_string())
                .or_default()
                .extend(read);
        }
    }

    fn write_line(&mut self, line: Map<String, Value>) {
        if let Ok(text) = serde_json::to_string(&Value::Object(line))
            && let Err(e) = writeln!(self.file, "{text}")
        {
            warn!("failed to write traffic log entry: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParameterId;
    use tempfile::NamedTempFile;

    fn read_lines(path: &str) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn request_line_carries_id_and_timestamp() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Full, path).unwrap();
        let rid = logger.log_request("GET", "/devices/d1/points", None);

        let lines = read_lines(path);
        assert_eq!(lines[0]["dir"], "req");
        assert_eq!(lines[0]["method"], "GET");
        assert_eq!(lines[0]["rid"], rid.as_str());
        assert!(lines[0]["ts"].as_str().is_some());
    }

    #[test]
    fn diffed_reads_log_full_first_then_changes() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Diffed, path).unwrap();

        logger.log_points("r1", "d1", &[DevicePoint::new(ParameterId(528), 60.0)]);
        logger.log_points("r2", "d1", &[DevicePoint::new(ParameterId(528), 61.5)]);
        logger.log_points("r3", "d1", &[DevicePoint::new(ParameterId(528), 61.5)]);

        let lines = read_lines(path);
        assert_eq!(lines[0]["full"], true);
        assert_eq!(lines[0]["body"]["points"]["528"], 60.0);
        let changes = lines[1]["changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["id"], 528);
        assert_eq!(changes[0]["old"], 60.0);
        assert_eq!(lines[2]["changes"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn subset_reads_extend_the_baseline() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Diffed, path).unwrap();

        logger.log_points("r1", "d1", &[DevicePoint::new(ParameterId(528), 60.0)]);
        logger.log_points("r2", "d1", &[DevicePoint::new(ParameterId(512), 12.0)]);
        logger.log_points("r3", "d1", &[DevicePoint::new(ParameterId(512), 12.0)]);
        logger.log_points("r4", "d2", &[DevicePoint::new(ParameterId(512), 12.0)]);

        let lines = read_lines(path);
        assert_eq!(lines[1]["changes"][0]["old"], Value::Null);
        assert_eq!(lines[2]["changes"].as_array().unwrap().len(), 0);
        assert_eq!(lines[3]["full"], true);
        assert_eq!(lines[3]["device"], "d2");
    }

    #[test]
    fn writes_and_errors_are_logged() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Full, path).unwrap();
        let values = PointValues::from([(ParameterId(527), 65.0)]);
        logger.log_write("r1", "d1", &values, 200);
        logger.log_error("r2", "HTTP status 409");

        let lines = read_lines(path);
        assert_eq!(lines[0]["dir"], "write");
        assert_eq!(lines[0]["values"]["527"], 65.0);
        assert_eq!(lines[1]["dir"], "err");
        assert!(lines[1].get("full").is_none());
    }
}
