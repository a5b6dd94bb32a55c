//! Object id grammar: `indexId_copyNum_rand5_rand5_seq`
use rand::prelude::*;

use whisper_util::error::Error;

/// Derived view of an oid
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OidInfo {
	pub index_id: u32,
	pub copy_num: u32,
	/// This copy's sequence number
	pub seq: u32,
}

impl OidInfo {
	pub fn parse(oid: &str) -> Result<OidInfo, Error> {
		let parts: Vec<&str> = oid.split('_').collect();
		if parts.len() != 5 {
			return Err(Error::Message(format!("invalid oid {}", oid)));
		}
		let bad = |_| Error::Message(format!("invalid oid {}", oid));
		Ok(OidInfo {
			index_id: parts[0].parse().map_err(bad)?,
			copy_num: parts[1].parse().map_err(bad)?,
			seq: parts[4].parse().map_err(bad)?,
		})
	}
}

/// `indexId_copyNum_rand5_rand5_0`
pub fn gen_oid(index_id: u32, copy_num: u32) -> String {
	format!("{}_0", gen_oid_no_suffix(index_id, copy_num))
}

/// `indexId_copyNum_rand5_rand5`: the copy suffix is appended per upload
pub fn gen_oid_no_suffix(index_id: u32, copy_num: u32) -> String {
	let mut rng = thread_rng();
	format!(
		"{}_{}_{}_{}",
		index_id,
		copy_num,
		rng.gen_range(0..100_000),
		rng.gen_range(0..100_000)
	)
}

/// All copy oids of the object `oid` belongs to: walks up to the 4th
/// underscore to recover the prefix and the copy number, then returns
/// `[prefix_0, ..., prefix_copyNum]`
pub fn oid_siblings(oid: &str) -> Result<Vec<String>, Error> {
	let parts: Vec<&str> = oid.split('_').collect();
	if parts.len() != 5 {
		return Err(Error::Message(format!("invalid oid {}", oid)));
	}
	let copy_num: u32 = parts[1]
		.parse()
		.map_err(|_| Error::Message(format!("invalid oid {}", oid)))?;

	let prefix = format!("{}_{}_{}_{}_", parts[0], parts[1], parts[2], parts[3]);
	Ok((0..=copy_num).map(|i| format!("{}{}", prefix, i)).collect())
}

/// The records a status change addresses: a full copy oid (5 parts)
/// addresses itself, a logical oid (4 parts, no copy suffix) addresses
/// every copy. Returns the owning index id and the target oids.
pub fn status_target_oids(oid: &str) -> Result<(u32, Vec<String>), Error> {
	let parts: Vec<&str> = oid.split('_').collect();
	let bad = || Error::Message(format!("invalid oid {}", oid));
	match parts.len() {
		5 => {
			let info = OidInfo::parse(oid)?;
			Ok((info.index_id, vec![oid.to_string()]))
		}
		4 => {
			let index_id: u32 = parts[0].parse().map_err(|_| bad())?;
			let copy_num: u32 = parts[1].parse().map_err(|_| bad())?;
			Ok((
				index_id,
				(0..=copy_num).map(|i| format!("{}_{}", oid, i)).collect(),
			))
		}
		_ => Err(bad()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_gen_oid_shape() {
		let oid = gen_oid(3, 2);
		let info = OidInfo::parse(&oid).unwrap();
		assert_eq!(info.index_id, 3);
		assert_eq!(info.copy_num, 2);
		assert_eq!(info.seq, 0);
	}

	#[test]
	fn test_rand_components_bounded() {
		for _ in 0..100 {
			let oid = gen_oid_no_suffix(1, 1);
			let parts: Vec<&str> = oid.split('_').collect();
			assert_eq!(parts.len(), 4);
			assert!(parts[2].parse::<u32>().unwrap() < 100_000);
			assert!(parts[3].parse::<u32>().unwrap() < 100_000);
		}
	}

	#[test]
	fn test_parse_rejects_malformed() {
		assert!(OidInfo::parse("1_2_3_4").is_err());
		assert!(OidInfo::parse("1_2_3_4_5_6").is_err());
		assert!(OidInfo::parse("a_2_3_4_5").is_err());
		assert!(OidInfo::parse("").is_err());
	}

	#[test]
	fn test_oid_siblings() {
		let siblings = oid_siblings("7_2_11_22_1").unwrap();
		assert_eq!(
			siblings,
			vec!["7_2_11_22_0", "7_2_11_22_1", "7_2_11_22_2"]
		);
		assert!(oid_siblings("7_2_11").is_err());
	}

	#[test]
	fn test_status_target_oids() {
		let (index_id, targets) = status_target_oids("7_1_11_22_0").unwrap();
		assert_eq!(index_id, 7);
		assert_eq!(targets, vec!["7_1_11_22_0"]);

		let (index_id, targets) = status_target_oids("7_1_11_22").unwrap();
		assert_eq!(index_id, 7);
		assert_eq!(targets, vec!["7_1_11_22_0", "7_1_11_22_1"]);

		assert!(status_target_oids("7_1_11").is_err());
	}
}
