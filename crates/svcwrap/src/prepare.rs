//! Per-launch preparation: environment merging and drive mappings.
//!
//! A drive letter becomes a symlink `<root>/<LETTER>` pointing at a local
//! directory, or at a network share mounted under the network root
//! (`//host/share/dir` resolves to `<network_root>/host/share/dir`).

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use svcwrap_core::config::DriveRoots;
use svcwrap_core::{ConfigurationError, DriveMapping, DriveTarget};

pub type Environment = Vec<(OsString, OsString)>;

/// Inherited environment plus overrides. Inherited order is kept, an override
/// replaces a variable in place, new names are appended, later overrides win.
pub fn build_environment<I, K, V>(
	inherited: I,
	overrides: &[(String, String)],
) -> Result<Environment, ConfigurationError>
where
	I: IntoIterator<Item = (K, V)>,
	K: Into<OsString>,
	V: Into<OsString>,
{
	let mut env: Environment = inherited
		.into_iter()
		.map(|(k, v)| (k.into(), v.into()))
		.collect();

	for (name, value) in overrides {
		if name.is_empty() || name.contains('=') || name.contains('\0') {
			return Err(ConfigurationError::InvalidEnvironment { name: name.clone() });
		}
		let key = OsString::from(name);
		match env.iter_mut().find(|entry| entry.0 == key) {
			Some(entry) => entry.1 = OsString::from(value),
			None => env.push((key, OsString::from(value))),
		}
	}
	Ok(env)
}

/// Applies every mapping, returning the links now in place.
pub fn apply_drive_mappings(
	mappings: &[DriveMapping],
	roots: &DriveRoots,
) -> Result<Vec<PathBuf>, ConfigurationError> {
	let mut links = Vec::with_capacity(mappings.len());
	for mapping in mappings {
		links.push(apply_drive_mapping(mapping, roots)?);
	}
	Ok(links)
}

fn apply_drive_mapping(
	mapping: &DriveMapping,
	roots: &DriveRoots,
) -> Result<PathBuf, ConfigurationError> {
	let fail = |reason: String| ConfigurationError::DriveMapping {
		letter: mapping.letter,
		target: match &mapping.target {
			DriveTarget::Local(p) => p.display().to_string(),
			DriveTarget::Network(p) => p.clone(),
		},
		reason,
	};

	if !mapping.letter.is_ascii_alphabetic() {
		return Err(ConfigurationError::InvalidDriveLetter(mapping.letter));
	}

	let target = match &mapping.target {
		DriveTarget::Local(path) => path.clone(),
		DriveTarget::Network(unc) => {
			let relative = parse_network_path(unc)
				.ok_or_else(|| fail("expected a network path of the form //host/share".into()))?;
			roots.network_root.join(relative)
		}
	};
	if !target.is_dir() {
		return Err(fail(format!("{} is not an accessible directory", target.display())));
	}

	std::fs::create_dir_all(&roots.root)
		.map_err(|e| fail(format!("cannot create {}: {}", roots.root.display(), e)))?;

	let link = roots.root.join(mapping.letter.to_ascii_uppercase().to_string());
	if let Ok(meta) = std::fs::symlink_metadata(&link) {
		if !meta.file_type().is_symlink() {
			return Err(fail(format!("{} exists and is not a drive link", link.display())));
		}
		if std::fs::read_link(&link).ok().as_deref() == Some(target.as_path()) {
			tracing::debug!("drive {}: already mapped to {}", mapping.letter, target.display());
			return Ok(link);
		}
		std::fs::remove_file(&link)
			.map_err(|e| fail(format!("cannot replace {}: {}", link.display(), e)))?;
	}

	std::os::unix::fs::symlink(&target, &link)
		.map_err(|e| fail(format!("cannot link {}: {}", link.display(), e)))?;
	tracing::info!("mapped drive {}: to {}", mapping.letter, target.display());
	Ok(link)
}

/// `//host/share/rest` (or with backslashes) to `host/share/rest`.
fn parse_network_path(unc: &str) -> Option<PathBuf> {
	let normalized = unc.replace('\\', "/");
	let rest = normalized.strip_prefix("//")?;
	let mut parts = rest.split('/').filter(|p| !p.is_empty());
	let host = parts.next()?;
	let share = parts.next()?;
	let mut path = Path::new(host).join(share);
	for part in parts {
		if part == ".." {
			return None;
		}
		path.push(part);
	}
	Some(path)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roots(dir: &Path) -> DriveRoots {
		DriveRoots {
			root: dir.join("drives"),
			network_root: dir.join("net"),
		}
	}

	#[test]
	fn overrides_replace_and_append() {
		let inherited = vec![("PATH", "/bin"), ("HOME", "/root")];
		let env = build_environment(
			inherited,
			&[
				("HOME".into(), "/srv".into()),
				("MODE".into(), "a".into()),
				("MODE".into(), "b".into()),
			],
		)
		.unwrap();
		assert_eq!(
			env,
			vec![
				(OsString::from("PATH"), OsString::from("/bin")),
				(OsString::from("HOME"), OsString::from("/srv")),
				(OsString::from("MODE"), OsString::from("b")),
			]
		);
	}

	#[test]
	fn invalid_override_names_the_entry() {
		let err = build_environment(Vec::<(String, String)>::new(), &[("".into(), "x".into())])
			.unwrap_err();
		assert_eq!(err, ConfigurationError::InvalidEnvironment { name: String::new() });
	}

	#[test]
	fn local_drive_becomes_symlink() {
		let dir = tempfile::tempdir().unwrap();
		let data = dir.path().join("data");
		std::fs::create_dir(&data).unwrap();
		let mapping = DriveMapping { letter: 'x', target: DriveTarget::Local(data.clone()) };

		let links = apply_drive_mappings(&[mapping.clone()], &roots(dir.path())).unwrap();
		assert_eq!(links, vec![dir.path().join("drives").join("X")]);
		assert_eq!(std::fs::read_link(&links[0]).unwrap(), data);

		// applying again before the next incarnation is a no-op
		apply_drive_mappings(&[mapping], &roots(dir.path())).unwrap();
	}

	#[test]
	fn remapping_replaces_old_link() {
		let dir = tempfile::tempdir().unwrap();
		let a = dir.path().join("a");
		let b = dir.path().join("b");
		std::fs::create_dir(&a).unwrap();
		std::fs::create_dir(&b).unwrap();
		let r = roots(dir.path());
		apply_drive_mappings(&[DriveMapping { letter: 'Q', target: DriveTarget::Local(a) }], &r)
			.unwrap();
		let links = apply_drive_mappings(
			&[DriveMapping { letter: 'Q', target: DriveTarget::Local(b.clone()) }],
			&r,
		)
		.unwrap();
		assert_eq!(std::fs::read_link(&links[0]).unwrap(), b);
	}

	#[test]
	fn missing_local_directory_fails() {
		let dir = tempfile::tempdir().unwrap();
		let mapping = DriveMapping {
			letter: 'M',
			target: DriveTarget::Local(dir.path().join("nope")),
		};
		match apply_drive_mappings(&[mapping], &roots(dir.path())) {
			Err(ConfigurationError::DriveMapping { letter, .. }) => assert_eq!(letter, 'M'),
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn network_drive_resolves_under_network_root() {
		let dir = tempfile::tempdir().unwrap();
		let share = dir.path().join("net").join("files").join("share");
		std::fs::create_dir_all(&share).unwrap();
		let mapping = DriveMapping {
			letter: 'N',
			target: DriveTarget::Network(r"\\files\share".into()),
		};
		let links = apply_drive_mappings(&[mapping], &roots(dir.path())).unwrap();
		assert_eq!(std::fs::read_link(&links[0]).unwrap(), share);
	}

	#[test]
	fn network_path_shapes() {
		assert_eq!(parse_network_path("//h/s"), Some(PathBuf::from("h/s")));
		assert_eq!(parse_network_path("//h/s/a/b"), Some(PathBuf::from("h/s/a/b")));
		assert_eq!(parse_network_path("//h"), None);
		assert_eq!(parse_network_path("/h/s"), None);
		assert_eq!(parse_network_path("//h/s/../x"), None);
	}

	#[test]
	fn regular_file_in_the_way_is_an_error() {
		let dir = tempfile::tempdir().unwrap();
		let r = roots(dir.path());
		std::fs::create_dir_all(&r.root).unwrap();
		std::fs::write(r.root.join("Z"), b"").unwrap();
		let mapping = DriveMapping {
			letter: 'z',
			target: DriveTarget::Local(dir.path().to_path_buf()),
		};
		assert!(matches!(
			apply_drive_mappings(&[mapping], &r),
			Err(ConfigurationError::DriveMapping { .. })
		));
	}
}
