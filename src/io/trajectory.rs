//! Plain-text trajectory persistence.
//!
//! One line per frame: `t rx ry rz tx ty tz`, space separated, full f64
//! round-trip precision. Import and export are exact inverses.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::core::types::Pose6D;
use crate::error::SlamError;

/// Write a trajectory to a text file.
pub fn export_trajectory<P: AsRef<Path>>(
    path: P,
    trajectory: &[(f64, Pose6D)],
) -> Result<(), SlamError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    for (time, pose) in trajectory {
        writeln!(
            writer,
            "{} {} {} {} {} {} {}",
            time, pose.rx, pose.ry, pose.rz, pose.tx, pose.ty, pose.tz
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a trajectory written by [`export_trajectory`].
pub fn import_trajectory<P: AsRef<Path>>(path: P) -> Result<Vec<(f64, Pose6D)>, SlamError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut trajectory = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 7 {
            return Err(SlamError::TrajectoryFormat {
                line: index + 1,
                reason: format!("expected 7 fields, found {}", fields.len()),
            });
        }

        let mut values = [0.0f64; 7];
        for (slot, field) in values.iter_mut().zip(&fields) {
            *slot = field.parse().map_err(|_| SlamError::TrajectoryFormat {
                line: index + 1,
                reason: format!("not a number: {field:?}"),
            })?;
        }

        trajectory.push((
            values[0],
            Pose6D::new(values[1], values[2], values[3], values[4], values[5], values[6]),
        ));
    }

    Ok(trajectory)
}
