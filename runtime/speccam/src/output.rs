// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {
    ams_as7265x_protocols::RecordSink,
    chrono::Local,
    glib::{Error, FileError},
    std::{
        fs::{read_dir, DirBuilder, File},
        io::Write,
        os::unix::fs::DirBuilderExt,
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    },
    tracing::debug,
};

const DATA_FILE_PREFIX: &str = "AS7265x_data_";
const DATA_FILE_SUFFIX: &str = ".txt";

/// The one-shot slot carrying the armed image path from the shutter press
/// to the pipeline's still writer.
#[derive(Clone, Default)]
pub struct ImageNameSlot(Arc<Mutex<Option<PathBuf>>>);

impl ImageNameSlot {
    fn arm(&self, path: PathBuf) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(path);
        }
    }

    /// Take the armed path, disarming the slot.
    pub fn take(&self) -> Option<PathBuf> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// The daily spectral data log.
///
/// Records land in `<root>/YYYY-MM-DD/AS7265x_data_NN.txt` where NN picks
/// the first fresh number in the directory. Every line is LF terminated
/// and flushed as written.
pub struct OutputLog {
    daily_dir: PathBuf,
    file: File,
    data_time: String,
    armed_name: ImageNameSlot,
}

impl OutputLog {
    pub fn new(path_root: &Path) -> Result<Self, Error> {
        let daily_dir = path_root.join(Local::now().format("%Y-%m-%d").to_string());

        if !daily_dir.is_dir() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o777)
                .create(&daily_dir)
                .map_err(|e| {
                    let msg = format!(
                        "Failed to create daily directory '{}': {}",
                        daily_dir.display(),
                        e,
                    );
                    Error::new(FileError::Failed, &msg)
                })?;
        }

        let file_path = daily_dir.join(format!(
            "{}{:02}{}",
            DATA_FILE_PREFIX,
            next_file_number(&daily_dir)?,
            DATA_FILE_SUFFIX,
        ));

        let file = File::create(&file_path).map_err(|e| {
            let msg = format!("Could not open output file '{}': {}", file_path.display(), e);
            Error::new(FileError::Failed, &msg)
        })?;

        debug!("the output file is {}", file_path.display());

        Ok(Self {
            daily_dir,
            file,
            data_time: String::new(),
            armed_name: Default::default(),
        })
    }

    pub fn write_line(&mut self, data: &str) -> Result<usize, Error> {
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.extend_from_slice(data.as_bytes());
        frame.push(b'\n');

        self.file
            .write_all(&frame)
            .and_then(|_| self.file.flush())
            .map(|_| frame.len())
            .map_err(|e| {
                let msg = format!("Write to output file failed: {}", e);
                Error::new(FileError::Io, &msg)
            })
    }

    /// Capture the shutter press time used to stamp the record block and to
    /// name the sibling image.
    pub fn stamp_now(&mut self) {
        self.data_time = Local::now().format("%H-%M-%S").to_string();
    }

    pub fn write_stamp(&mut self) -> Result<usize, Error> {
        let stamp = self.data_time.clone();
        self.write_line(&stamp)
    }

    /// Arm the one-shot image name for the current stamp.
    pub fn arm_image_name(&mut self) {
        let path = self.daily_dir.join(format!("{}.jpg", self.data_time));
        self.armed_name.arm(path);
    }

    pub fn image_name_slot(&self) -> ImageNameSlot {
        self.armed_name.clone()
    }

    pub fn daily_dir(&self) -> &Path {
        &self.daily_dir
    }
}

impl RecordSink for OutputLog {
    fn write_record(&mut self, line: &str) -> Result<usize, Error> {
        self.write_line(line)
    }

    fn write_shot_stamp(&mut self) -> Result<usize, Error> {
        self.write_stamp()
    }
}

// The first number that yields a fresh data file: one past the highest in
// the directory, or zero on a clean day.
fn next_file_number(daily_dir: &Path) -> Result<u32, Error> {
    let entries = read_dir(daily_dir).map_err(|e| {
        let msg = format!("Failed to open directory '{}': {}", daily_dir.display(), e);
        Error::new(FileError::Failed, &msg)
    })?;

    let mut max_number: Option<u32> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();

        let number = name
            .strip_prefix(DATA_FILE_PREFIX)
            .and_then(|rest| rest.strip_suffix(DATA_FILE_SUFFIX))
            .and_then(|digits| digits.parse::<u32>().ok());

        if let Some(number) = number {
            if max_number.map_or(true, |max| number > max) {
                max_number = Some(number);
            }
        }
    }

    Ok(max_number.map_or(0, |max| max + 1))
}

#[cfg(test)]
mod test {
    use {super::*, std::fs::read_to_string, tempfile::tempdir};

    #[test]
    fn file_numbers_increase_across_opens() {
        let root = tempdir().unwrap();

        let first = OutputLog::new(root.path()).unwrap();
        let second = OutputLog::new(root.path()).unwrap();

        let mut names: Vec<String> = read_dir(first.daily_dir())
            .unwrap()
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["AS7265x_data_00.txt", "AS7265x_data_01.txt"]);
        drop(second);
    }

    #[test]
    fn file_number_scan_is_idempotent() {
        let root = tempdir().unwrap();
        let log = OutputLog::new(root.path()).unwrap();

        assert_eq!(next_file_number(log.daily_dir()).unwrap(), 1);
        assert_eq!(next_file_number(log.daily_dir()).unwrap(), 1);
    }

    #[test]
    fn unrelated_files_are_ignored_by_the_scan() {
        let root = tempdir().unwrap();
        let log = OutputLog::new(root.path()).unwrap();

        File::create(log.daily_dir().join("notes.txt")).unwrap();
        File::create(log.daily_dir().join("AS7265x_data_xx.txt")).unwrap();

        assert_eq!(next_file_number(log.daily_dir()).unwrap(), 1);
    }

    #[test]
    fn lines_are_linefeed_terminated() {
        let root = tempdir().unwrap();
        let mut log = OutputLog::new(root.path()).unwrap();

        log.write_line("Sensor Gain,2").unwrap();
        log.write_line("").unwrap();

        let path = log.daily_dir().join("AS7265x_data_00.txt");
        assert_eq!(read_to_string(path).unwrap(), "Sensor Gain,2\n\n");
    }

    #[test]
    fn armed_image_name_is_one_shot() {
        let root = tempdir().unwrap();
        let mut log = OutputLog::new(root.path()).unwrap();
        let slot = log.image_name_slot();

        log.stamp_now();
        log.arm_image_name();
        let stamp_path = log.daily_dir().join(format!("{}.jpg", log.data_time));

        assert_eq!(slot.take(), Some(stamp_path));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn stamp_writes_into_the_record() {
        let root = tempdir().unwrap();
        let mut log = OutputLog::new(root.path()).unwrap();

        log.data_time = "10-20-30".to_string();
        log.write_stamp().unwrap();

        let path = log.daily_dir().join("AS7265x_data_00.txt");
        assert_eq!(read_to_string(path).unwrap(), "10-20-30\n");
    }
}
