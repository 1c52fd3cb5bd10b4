#![forbid(unsafe_code)]

use std::collections::BTreeMap;

/// Amount key matched when no exact rule exists.
pub const WILDCARD_AMOUNT: u64 = 0;

/// Donation amount -> ordered command templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewardRules {
	by_amount: BTreeMap<u64, Vec<String>>,
}

impl RewardRules {
	pub fn new(by_amount: BTreeMap<u64, Vec<String>>) -> Self {
		Self { by_amount }
	}

	pub fn insert(&mut self, amount: u64, templates: Vec<String>) {
		self.by_amount.insert(amount, templates);
	}

	/// Exact amount first, then the wildcard rule.
	///
	/// An exact rule with no templates means "no reward" and does not fall through.
	pub fn lookup(&self, amount: u64) -> Option<&[String]> {
		let templates = self
			.by_amount
			.get(&amount)
			.or_else(|| self.by_amount.get(&WILDCARD_AMOUNT))?;
		if templates.is_empty() { None } else { Some(templates.as_slice()) }
	}

	pub fn is_empty(&self) -> bool {
		self.by_amount.is_empty()
	}

	pub fn len(&self) -> usize {
		self.by_amount.len()
	}

	pub fn iter(&self) -> impl Iterator<Item = (u64, &[String])> {
		self.by_amount.iter().map(|(k, v)| (*k, v.as_slice()))
	}
}
