use std::collections::BTreeMap;
use crate::segment::{ReceptionClaim, ReportSegment};

/// A set of non-overlapping, non-adjacent byte ranges `[begin, end)` kept sorted by offset.
///  Inserting a range merges it with all ranges it overlaps or touches.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FragmentSet {
    /// begin -> end
    ranges: BTreeMap<u64, u64>,
}

/// The bounds and claims of a single report segment, with claim offsets relative to the lower bound
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReportScope {
    pub lower_bound: u64,
    pub upper_bound: u64,
    pub claims: Vec<ReceptionClaim>,
}

impl FragmentSet {
    pub fn new() -> FragmentSet {
        Default::default()
    }

    /// returns true if the set changed, i.e. if at least one byte of the range was not yet contained
    pub fn insert(&mut self, begin: u64, end: u64) -> bool {
        if begin >= end {
            return false;
        }

        let mut merged_begin = begin;
        let mut merged_end = end;
        if let Some((&prev_begin, &prev_end)) = self.ranges.range(..=begin).next_back() {
            if prev_end >= end {
                return false;
            }
            if prev_end >= begin {
                merged_begin = prev_begin;
            }
        }

        let absorbed = self.ranges.range(merged_begin..=end)
            .map(|(&b, _)| b)
            .collect::<Vec<_>>();
        for b in absorbed {
            if let Some(e) = self.ranges.remove(&b) {
                merged_end = merged_end.max(e);
            }
        }

        self.ranges.insert(merged_begin, merged_end);
        true
    }

    /// true if every byte of `[begin, end)` is part of the set
    pub fn contains(&self, begin: u64, end: u64) -> bool {
        if begin >= end {
            return true;
        }
        match self.ranges.range(..=begin).next_back() {
            Some((_, &e)) => e >= end,
            None => false,
        }
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item=(u64, u64)> + '_ {
        self.ranges.iter().map(|(&b, &e)| (b, e))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn highest_end(&self) -> Option<u64> {
        self.ranges.last_key_value().map(|(_, &e)| e)
    }

    /// The sub-ranges of `[begin, end)` that are *not* part of the set, in ascending order
    pub fn gaps_within(&self, begin: u64, end: u64) -> Vec<(u64, u64)> {
        let mut result = Vec::new();
        if begin >= end {
            return result;
        }

        let mut cursor = begin;
        let first_relevant = match self.ranges.range(..=begin).next_back() {
            Some((&b, &e)) if e > begin => b,
            _ => begin,
        };
        for (&b, &e) in self.ranges.range(first_relevant..end) {
            if b > cursor {
                result.push((cursor, b));
            }
            cursor = cursor.max(e);
            if cursor >= end {
                break;
            }
        }
        if cursor < end {
            result.push((cursor, end));
        }
        result
    }

    /// The ranges intersecting `[lower_bound, upper_bound)` as reception claims relative to the lower bound
    pub fn reception_claims(&self, lower_bound: u64, upper_bound: u64) -> Vec<ReceptionClaim> {
        let mut result = Vec::new();
        if lower_bound >= upper_bound {
            return result;
        }

        let first_relevant = match self.ranges.range(..=lower_bound).next_back() {
            Some((&b, &e)) if e > lower_bound => b,
            _ => lower_bound,
        };
        for (&b, &e) in self.ranges.range(first_relevant..upper_bound) {
            let claim_begin = b.max(lower_bound);
            let claim_end = e.min(upper_bound);
            if claim_end > claim_begin {
                result.push(ReceptionClaim {
                    offset: claim_begin - lower_bound,
                    length: claim_end - claim_begin,
                });
            }
        }
        result
    }

    /// Splits the reception claims for `[lower_bound, upper_bound)` into as many report scopes as
    ///  are needed to have at most `max_claims_per_report` claims each. The scopes tile the
    ///  original bounds: each scope's lower bound is the previous scope's upper bound, the first
    ///  scope starts at `lower_bound` and the last one ends at `upper_bound`.
    pub fn report_scopes(&self, lower_bound: u64, upper_bound: u64, max_claims_per_report: usize) -> Vec<ReportScope> {
        let max_claims_per_report = max_claims_per_report.max(1);
        let absolute_claims = self.reception_claims(lower_bound, upper_bound)
            .into_iter()
            .map(|c| (lower_bound + c.offset, lower_bound + c.offset + c.length))
            .collect::<Vec<_>>();

        if absolute_claims.len() <= max_claims_per_report {
            return vec![ReportScope {
                lower_bound,
                upper_bound,
                claims: to_relative(&absolute_claims, lower_bound),
            }];
        }

        let mut result = Vec::new();
        let mut scope_lower_bound = lower_bound;
        let mut chunks = absolute_claims.chunks(max_claims_per_report).peekable();
        while let Some(chunk) = chunks.next() {
            let scope_upper_bound = if chunks.peek().is_some() {
                chunk.last().map(|&(_, e)| e).unwrap_or(upper_bound)
            }
            else {
                upper_bound
            };
            result.push(ReportScope {
                lower_bound: scope_lower_bound,
                upper_bound: scope_upper_bound,
                claims: to_relative(chunk, scope_lower_bound),
            });
            scope_lower_bound = scope_upper_bound;
        }
        result
    }

    /// merges the claims of a report segment into the set
    pub fn add_report_claims(&mut self, report: &ReportSegment) -> bool {
        let mut changed = false;
        for claim in &report.claims {
            let begin = report.lower_bound + claim.offset;
            changed |= self.insert(begin, begin + claim.length);
        }
        changed
    }
}

fn to_relative(absolute: &[(u64, u64)], lower_bound: u64) -> Vec<ReceptionClaim> {
    absolute.iter()
        .map(|&(b, e)| ReceptionClaim { offset: b - lower_bound, length: e - b })
        .collect()
}
