//! Allocation tracking and leak reporting
//!
//! The tracker records every allocation, free, increment and decrement with
//! its call-site category. The report it produces at exit is the only
//! window into refcount discipline bugs introduced by the code generator,
//! so it keeps the complete multiset of sites per address rather than mere
//! totals. It is bookkeeping only: underflow and double-release detection
//! live in the core and stay armed when tracking is off.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::memory::{ManagedMemory, SiteTag, GUARD_BIT};
use crate::value::{HeapKind, PtrTag};

#[derive(Default)]
pub struct HeapTracker {
    allocated: HashSet<u32>,
    freed: HashSet<u32>,
    times_allocated: HashMap<u32, u32>,
    times_freed: HashMap<u32, u32>,
    incref_sites: HashMap<u32, BTreeMap<SiteTag, u32>>,
    decref_sites: HashMap<u32, BTreeMap<SiteTag, u32>>,
    known_tags: HashMap<u32, PtrTag>,
    min_address: Option<u32>,
    max_address: Option<u32>,
}

impl HeapTracker {
    pub fn new() -> HeapTracker {
        HeapTracker::default()
    }

    pub fn record_alloc(&mut self, user_ptr: u32, raw_ptr: u32, end: u32) {
        self.allocated.insert(user_ptr);
        self.freed.remove(&user_ptr);
        *self.times_allocated.entry(user_ptr).or_insert(0) += 1;

        self.min_address = Some(match self.min_address {
            Some(min) => min.min(raw_ptr),
            None => raw_ptr,
        });
        self.max_address = Some(match self.max_address {
            Some(max) => max.max(end),
            None => end,
        });
    }

    pub fn record_free(&mut self, user_ptr: u32) {
        self.allocated.remove(&user_ptr);
        self.freed.insert(user_ptr);
        *self.times_freed.entry(user_ptr).or_insert(0) += 1;
    }

    pub fn note_tag(&mut self, user_ptr: u32, tag: PtrTag) {
        self.known_tags.insert(user_ptr, tag);
    }

    pub fn mark_incref(&mut self, user_ptr: u32, site: SiteTag) {
        *self
            .incref_sites
            .entry(user_ptr)
            .or_insert_with(BTreeMap::new)
            .entry(site)
            .or_insert(0) += 1;
    }

    pub fn mark_decref(&mut self, user_ptr: u32, site: SiteTag) {
        *self
            .decref_sites
            .entry(user_ptr)
            .or_insert_with(BTreeMap::new)
            .entry(site)
            .or_insert(0) += 1;
    }

    /// Total allocations over the run, reallocations of the same address
    /// included
    pub fn allocations(&self) -> u32 {
        self.times_allocated.values().sum()
    }

    /// Total frees over the run
    pub fn frees(&self) -> u32 {
        self.times_freed.values().sum()
    }

    /// Addresses still live right now
    pub fn live_addresses(&self) -> Vec<u32> {
        let mut addresses: Vec<u32> = self.allocated.iter().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    /// Builds the report for everything still live, reading current object
    /// state out of the heap
    pub fn leak_report(&self, mem: &ManagedMemory) -> LeakReport {
        let peak_span = match (self.min_address, self.max_address) {
            (Some(min), Some(max)) => max - min,
            _ => 0,
        };

        let leaked = self
            .live_addresses()
            .into_iter()
            .map(|user_ptr| {
                let tag = self.known_tags.get(&user_ptr).copied();
                LeakedObject {
                    user_ptr,
                    tag,
                    detail: self.describe(mem, user_ptr, tag),
                    ref_count: mem.ref_count(user_ptr),
                    incref_sites: self.site_multiset(&self.incref_sites, user_ptr),
                    decref_sites: self.site_multiset(&self.decref_sites, user_ptr),
                }
            })
            .collect();

        LeakReport {
            peak_span,
            allocations: self.allocations(),
            frees: self.frees(),
            leaked,
        }
    }

    fn site_multiset(
        &self,
        sites: &HashMap<u32, BTreeMap<SiteTag, u32>>,
        user_ptr: u32,
    ) -> Vec<(SiteTag, u32)> {
        sites
            .get(&user_ptr)
            .map(|counts| counts.iter().map(|(&site, &count)| (site, count)).collect())
            .unwrap_or_default()
    }

    fn describe(&self, mem: &ManagedMemory, user_ptr: u32, tag: Option<PtrTag>) -> String {
        match tag {
            Some(PtrTag::Tuple) => {
                format!("[{} elts]", mem.heap().word(user_ptr) & !GUARD_BIT)
            }
            Some(PtrTag::Closure) => {
                format!("[{} free vars]", mem.heap().word(user_ptr + 8) & !GUARD_BIT)
            }
            Some(PtrTag::GenericHeap) => {
                format!(">{}", HeapKind::from_word(mem.heap().word(user_ptr)).to_str())
            }
            Some(other) => other.to_str().to_string(),
            None => "never touched by incref/decref".to_string(),
        }
    }
}

/// Peak usage and per-leak attribution, produced at process exit
pub struct LeakReport {
    /// Distance between the lowest and highest addresses ever used
    pub peak_span: u32,
    pub allocations: u32,
    pub frees: u32,
    pub leaked: Vec<LeakedObject>,
}

pub struct LeakedObject {
    pub user_ptr: u32,
    pub tag: Option<PtrTag>,
    pub detail: String,
    pub ref_count: u32,
    pub incref_sites: Vec<(SiteTag, u32)>,
    pub decref_sites: Vec<(SiteTag, u32)>,
}

fn write_sites(
    formatter: &mut fmt::Formatter<'_>,
    label: &str,
    sites: &[(SiteTag, u32)],
) -> fmt::Result {
    write!(formatter, "    {}: ", label)?;
    if sites.is_empty() {
        writeln!(formatter, "(none)")
    } else {
        let rendered: Vec<String> = sites
            .iter()
            .map(|&(site, count)| format!("{} x{}", site, count))
            .collect();
        writeln!(formatter, "{}", rendered.join(", "))
    }
}

impl fmt::Display for LeakReport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(formatter, "==== MEMORY TRACE INFO ====")?;
        writeln!(formatter, "Max used span size: {}", self.peak_span)?;
        writeln!(formatter, "Objects allocated:  {}", self.allocations)?;
        writeln!(formatter, "Objects freed:      {}", self.frees)?;
        writeln!(formatter, "Objects leaked:     {}", self.leaked.len())?;

        if !self.leaked.is_empty() {
            writeln!(formatter, "---- LEAKED OBJECTS ----")?;
            for leak in &self.leaked {
                let tag = leak
                    .tag
                    .map(PtrTag::to_str)
                    .unwrap_or("unknown tag");
                writeln!(
                    formatter,
                    "{:#010x}: {} {}, ref count {}",
                    leak.user_ptr, tag, leak.detail, leak.ref_count
                )?;
                write_sites(formatter, "increfs", &leak.incref_sites)?;
                write_sites(formatter, "decrefs", &leak.decref_sites)?;
            }
        }

        write!(formatter, "==== END MEMORY TRACE INFO ====")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::MemoryConfig;
    use crate::value::Value;

    #[test]
    fn report_counts_and_peak_span() {
        let mut mem = ManagedMemory::new(MemoryConfig {
            trace: true,
            ..MemoryConfig::default()
        });

        let a = mem.alloc_tuple(&[Value::from_int(1)]).unwrap();
        let b = mem.alloc_string("abc").unwrap();
        mem.decref(b, SiteTag::Drop, false).unwrap();

        let report = mem.leak_report().unwrap();
        assert_eq!(2, report.allocations);
        assert_eq!(1, report.frees);
        assert_eq!(1, report.leaked.len());
        assert_eq!(a.untagged(), report.leaked[0].user_ptr);
        assert!(report.peak_span > 0);

        // Rendering must include the header and the leaked address
        let rendered = report.to_string();
        assert!(rendered.contains("MEMORY TRACE INFO"));
        assert!(rendered.contains(&format!("{:#010x}", a.untagged())));
    }

    #[test]
    fn freed_objects_leave_the_report() {
        let mut mem = ManagedMemory::new(MemoryConfig {
            trace: true,
            ..MemoryConfig::default()
        });

        let tuple = mem.alloc_tuple(&[]).unwrap();
        mem.decref(tuple, SiteTag::Drop, false).unwrap();

        let report = mem.leak_report().unwrap();
        assert!(report.leaked.is_empty());
        assert_eq!(report.allocations, report.frees);
    }
}
