//! Daily rollover directory layout: `${DataPath}/${StationName}_YYYYMMDD/`.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use tracing::info;

pub struct DailyLayout {
    data_path: PathBuf,
    station_name: String,
    config_file_to_copy: Option<PathBuf>,
    current_day: Mutex<Option<NaiveDate>>,
}

impl DailyLayout {
    pub fn new(data_path: PathBuf, station_name: String, config_file_to_copy: Option<PathBuf>) -> Self {
        Self {
            data_path,
            station_name,
            config_file_to_copy,
            current_day: Mutex::new(None),
        }
    }

    /// The directory for "today", creating it (and copying the config file
    /// into it, if configured) the first time a new day is observed.
    pub fn day_dir(&self) -> io::Result<PathBuf> {
        let today = Utc::now().date_naive();
        let mut current = self.current_day.lock().unwrap();

        let dir = self.dir_for(today);
        if *current != Some(today) {
            fs::create_dir_all(&dir)?;
            if let Some(src) = &self.config_file_to_copy {
                let dest = dir.join(src.file_name().unwrap_or_else(|| std::ffi::OsStr::new("config.cfg")));
                if let Err(e) = fs::copy(src, &dest) {
                    tracing::warn!(error = %e, "failed to copy configuration file on rollover");
                } else {
                    info!(dest = %dest.display(), "copied configuration file on rollover");
                }
            }
            info!(dir = %dir.display(), "rolled over to new day directory");
            *current = Some(today);
        }

        Ok(dir)
    }

    fn dir_for(&self, day: NaiveDate) -> PathBuf {
        self.data_path
            .join(format!("{}_{}", self.station_name, day.format("%Y%m%d")))
    }

    pub fn event_dir(&self, event_id: u64) -> io::Result<PathBuf> {
        let dir = self.day_dir()?.join(format!("event{:03}", event_id));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn stacks_dir(&self) -> io::Result<PathBuf> {
        let dir = self.day_dir()?.join("stacks");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn day_dir_is_created_under_station_prefix() {
        let base = tempdir().unwrap();
        let layout = DailyLayout::new(base.path().to_path_buf(), "STATION1".into(), None);
        let dir = layout.day_dir().unwrap();
        assert!(dir.exists());
        assert!(dir.file_name().unwrap().to_string_lossy().starts_with("STATION1_"));
    }

    #[test]
    fn event_dir_nests_under_day_dir() {
        let base = tempdir().unwrap();
        let layout = DailyLayout::new(base.path().to_path_buf(), "STATION1".into(), None);
        let event_dir = layout.event_dir(7).unwrap();
        assert!(event_dir.exists());
        assert_eq!(event_dir.file_name().unwrap(), "event007");
    }

    #[test]
    fn config_file_is_copied_into_day_dir_when_configured() {
        let base = tempdir().unwrap();
        let config_src = base.path().join("station.cfg");
        fs::write(&config_src, "camera-type = BASLER\n").unwrap();

        let layout = DailyLayout::new(base.path().join("data"), "STATION1".into(), Some(config_src));
        let dir = layout.day_dir().unwrap();
        assert!(dir.join("station.cfg").exists());
    }
}
