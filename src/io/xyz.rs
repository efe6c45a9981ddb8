//! Plain xyz files, single structures or multi-frame trajectories.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use nalgebra::Point3;

use crate::core::domain::{Atom, Cluster};

fn invalid(line: usize, msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("line {}: {}", line, msg.into()))
}

/// Reads every frame of an xyz file.
pub fn read_xyz(path: &Path) -> io::Result<Vec<Cluster>> {
    let content = fs::read_to_string(path)?;
    parse_xyz(&content)
}

/// Parses concatenated xyz frames: atom count, comment line, then one
/// `Symbol x y z` line per atom. Blank lines between frames are skipped.
pub fn parse_xyz(content: &str) -> io::Result<Vec<Cluster>> {
    let lines: Vec<&str> = content.lines().collect();
    let mut frames = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let header = lines[i].trim();
        if header.is_empty() {
            i += 1;
            continue;
        }
        let natoms: usize = header
            .parse()
            .map_err(|_| invalid(i + 1, format!("expected an atom count, found `{header}`")))?;
        if i + 2 + natoms > lines.len() {
            return Err(invalid(i + 1, format!("frame announces {natoms} atoms but the file ends early")));
        }

        let mut atoms = Vec::with_capacity(natoms);
        for (k, line) in lines[i + 2..i + 2 + natoms].iter().enumerate() {
            let lineno = i + 3 + k;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return Err(invalid(lineno, "expected `Symbol x y z`"));
            }
            let mut xyz = [0.0; 3];
            for (c, s) in xyz.iter_mut().zip(&parts[1..4]) {
                *c = s
                    .parse()
                    .map_err(|_| invalid(lineno, format!("invalid coordinate `{s}`")))?;
            }
            atoms.push(Atom::new(parts[0], Point3::new(xyz[0], xyz[1], xyz[2])));
        }
        frames.push(Cluster::new(atoms));
        i += 2 + natoms;
    }

    Ok(frames)
}

/// Writes one frame. `note` becomes the comment line.
pub fn write_xyz<W: Write>(out: &mut W, cluster: &Cluster, note: &str) -> io::Result<()> {
    writeln!(out, "{}", cluster.len())?;
    writeln!(out, "{}", note.replace('\n', " "))?;
    for atom in cluster.atoms() {
        let p = atom.position;
        writeln!(out, "{:<3} {:>15.8} {:>15.8} {:>15.8}", atom.symbol, p.x, p.y, p.z)?;
    }
    Ok(())
}
