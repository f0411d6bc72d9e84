// Private 2-way set-associative write-back cache with MESI snooping.
//
// Every mutating operation follows the same critical-section discipline:
// phase 1 resolves hit/miss and picks a victim under the cache lock, the
// bus emission runs with no lock held, and phase 2 re-acquires the lock to
// install the line and finalize MESI. Holding the lock across the emission
// would deadlock against peers whose snoop handlers take their own locks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, error};
use parking_lot::Mutex;

use crate::bus::{BusClient, Interconnect};
use crate::commons::{
    check_word_aligned, line_base, line_base_for, set_index, tag, word_offset, BusMsg, CacheStats,
    MesiState, SimError, SETS, WAYS, WORDS_PER_LINE, WORD_SIZE,
};
use crate::memory::MemoryPort;

pub type TraceHook = Box<dyn Fn(&str) + Send>;

#[derive(Clone, Copy, Debug)]
struct Line {
    tag: u64,
    valid: bool,
    dirty: bool,
    mesi: MesiState,
    last_use: u64,
    words: [u64; WORDS_PER_LINE],
}

impl Line {
    fn empty() -> Line {
        Line {
            tag: 0,
            valid: false,
            dirty: false,
            mesi: MesiState::Invalid,
            last_use: 0,
            words: [0; WORDS_PER_LINE],
        }
    }
}

#[derive(Clone, Copy)]
struct CacheSet {
    ways: [Line; WAYS],
}

/// Read-only snapshot of one way, for inspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineInfo {
    pub tag: u64,
    pub valid: bool,
    pub dirty: bool,
    pub mesi: MesiState,
    pub last_use: u64,
}

struct CacheInner {
    sets: [CacheSet; SETS],
    use_tick: u64,
    stats: CacheStats,
    trace: Option<TraceHook>,
}

impl CacheInner {
    fn new() -> CacheInner {
        CacheInner {
            sets: [CacheSet {
                ways: [Line::empty(); WAYS],
            }; SETS],
            use_tick: 0,
            stats: CacheStats::default(),
            trace: None,
        }
    }

    fn find_hit(&self, set_idx: usize, tag: u64) -> Option<usize> {
        self.sets[set_idx]
            .ways
            .iter()
            .position(|l| l.valid && l.tag == tag)
    }

    /// Invalid way first (lowest index), otherwise smallest use-tick.
    fn choose_victim(&self, set_idx: usize) -> usize {
        let set = &self.sets[set_idx];
        if let Some(w) = set.ways.iter().position(|l| !l.valid) {
            return w;
        }
        set.ways
            .iter()
            .enumerate()
            .min_by_key(|(_, l)| l.last_use)
            .map(|(w, _)| w)
            .unwrap_or(0)
    }

    fn bump_tick(&mut self) -> u64 {
        self.use_tick += 1;
        self.use_tick
    }

    /// Write the full line (four 64-bit words) to memory and clear dirty.
    fn write_back(
        &mut self,
        set_idx: usize,
        way: usize,
        base: u64,
        mem: &dyn MemoryPort,
    ) -> Result<(), SimError> {
        let words = self.sets[set_idx].ways[way].words;
        for (i, w) in words.iter().enumerate() {
            mem.write_word(base + (i * WORD_SIZE) as u64, *w)?;
        }
        self.sets[set_idx].ways[way].dirty = false;
        self.stats.mem_writes += WORDS_PER_LINE as u64;
        self.stats.writebacks += 1;
        Ok(())
    }

    /// Bring the line at `base` into `way`, writing back a dirty victim
    /// first. The fill is read into a scratch buffer before anything is
    /// installed, so a failed memory access leaves the way untouched.
    fn fetch_line(
        &mut self,
        set_idx: usize,
        way: usize,
        base: u64,
        tg: u64,
        mem: &dyn MemoryPort,
    ) -> Result<(), SimError> {
        let victim = self.sets[set_idx].ways[way];
        if victim.valid && victim.dirty {
            let old_base = line_base_for(victim.tag, set_idx);
            self.write_back(set_idx, way, old_base, mem)?;
        }
        let mut words = [0u64; WORDS_PER_LINE];
        for (i, w) in words.iter_mut().enumerate() {
            *w = mem.read_word(base + (i * WORD_SIZE) as u64)?;
        }
        let tick = self.bump_tick();
        let line = &mut self.sets[set_idx].ways[way];
        line.words = words;
        line.tag = tg;
        line.valid = true;
        line.dirty = false;
        line.last_use = tick;
        self.stats.mem_reads += WORDS_PER_LINE as u64;
        self.stats.line_fills += 1;
        Ok(())
    }

    fn note(&self, msg: &str) {
        debug!("{}", msg);
        if let Some(hook) = &self.trace {
            hook(msg);
        }
    }
}

enum StorePath {
    Done,
    Upgrade,
    Fill(usize),
}

pub struct Cache {
    id: AtomicU32,
    mem: Arc<dyn MemoryPort>,
    bus: Mutex<Option<Arc<Interconnect>>>,
    inner: Mutex<CacheInner>,
}

impl Cache {
    pub fn new(id: u32, mem: Arc<dyn MemoryPort>) -> Cache {
        Cache {
            id: AtomicU32::new(id),
            mem,
            bus: Mutex::new(None),
            inner: Mutex::new(CacheInner::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    /// Without a bus the cache runs as a single-agent system and emits
    /// nothing.
    pub fn attach_to_bus(&self, bus: &Arc<Interconnect>) {
        *self.bus.lock() = Some(bus.clone());
    }

    /// Install a hook that receives one human-readable line per MESI
    /// transition and bus emission. The format is not contractual.
    pub fn set_trace_hook(&self, hook: impl Fn(&str) + Send + 'static) {
        self.inner.lock().trace = Some(Box::new(hook));
    }

    /// Aligned 64-bit load. Returns the word and whether it was a hit.
    pub fn load_word(&self, addr: u64) -> Result<(u64, bool), SimError> {
        check_word_aligned(addr)?;
        let set_idx = set_index(addr);
        let woff = word_offset(addr);
        let base = line_base(addr);
        let tg = tag(addr);
        let cid = self.id();

        // phase 1: hit check, victim choice on miss
        let victim = {
            let mut inner = self.inner.lock();
            if let Some(w) = inner.find_hit(set_idx, tg) {
                let tick = inner.bump_tick();
                let line = &mut inner.sets[set_idx].ways[w];
                line.last_use = tick;
                let value = line.words[woff];
                inner.stats.hits += 1;
                return Ok((value, true));
            }
            inner.choose_victim(set_idx)
        };

        // lock dropped: peers can take their own locks while they snoop
        self.emit(BusMsg::BusRd, base);

        // phase 2: write back the victim if dirty, fill, install Shared.
        // Shared is the conservative installation: the BusRd may have
        // matched a peer's copy.
        let mut inner = self.inner.lock();
        inner.fetch_line(set_idx, victim, base, tg, self.mem.as_ref())?;
        let line = &mut inner.sets[set_idx].ways[victim];
        line.mesi = MesiState::Shared;
        let value = line.words[woff];
        inner.stats.misses += 1;
        inner.note(&format!("C{}: fill {:#06x} -> S (load miss)", cid, base));
        Ok((value, false))
    }

    /// Aligned 64-bit store, write-allocate. Returns whether it was a hit.
    pub fn store_word(&self, addr: u64, value: u64) -> Result<bool, SimError> {
        check_word_aligned(addr)?;
        let set_idx = set_index(addr);
        let woff = word_offset(addr);
        let base = line_base(addr);
        let tg = tag(addr);
        let cid = self.id();

        loop {
            // phase 1
            let path = {
                let mut inner = self.inner.lock();
                if let Some(w) = inner.find_hit(set_idx, tg) {
                    match inner.sets[set_idx].ways[w].mesi {
                        MesiState::Modified => {
                            let tick = inner.bump_tick();
                            let line = &mut inner.sets[set_idx].ways[w];
                            line.words[woff] = value;
                            line.dirty = true;
                            line.last_use = tick;
                            inner.stats.hits += 1;
                            StorePath::Done
                        }
                        MesiState::Exclusive => {
                            let tick = inner.bump_tick();
                            let line = &mut inner.sets[set_idx].ways[w];
                            line.mesi = MesiState::Modified;
                            line.words[woff] = value;
                            line.dirty = true;
                            line.last_use = tick;
                            inner.stats.hits += 1;
                            inner.note(&format!("C{}: {:#06x} E -> M (store hit)", cid, base));
                            StorePath::Done
                        }
                        // Shared needs exclusive ownership first
                        _ => StorePath::Upgrade,
                    }
                } else {
                    StorePath::Fill(inner.choose_victim(set_idx))
                }
            };

            match path {
                StorePath::Done => return Ok(true),
                StorePath::Upgrade => {
                    self.emit(BusMsg::BusRdX, base);
                    let mut inner = self.inner.lock();
                    if let Some(w) = inner.find_hit(set_idx, tg) {
                        let tick = inner.bump_tick();
                        let line = &mut inner.sets[set_idx].ways[w];
                        line.mesi = MesiState::Modified;
                        line.words[woff] = value;
                        line.dirty = true;
                        line.last_use = tick;
                        inner.stats.hits += 1;
                        inner.note(&format!("C{}: {:#06x} S -> M (store upgrade)", cid, base));
                        return Ok(true);
                    }
                    // line lost to a concurrent BusRdX during the emission
                    // window: retry as a miss
                    continue;
                }
                StorePath::Fill(victim) => {
                    self.emit(BusMsg::BusRdX, base);
                    let mut inner = self.inner.lock();
                    inner.fetch_line(set_idx, victim, base, tg, self.mem.as_ref())?;
                    let line = &mut inner.sets[set_idx].ways[victim];
                    line.mesi = MesiState::Modified;
                    line.words[woff] = value;
                    line.dirty = true;
                    inner.stats.misses += 1;
                    inner.note(&format!("C{}: fill {:#06x} -> M (store miss)", cid, base));
                    return Ok(false);
                }
            }
        }
    }

    /// Bit-exact f64 load; no numeric conversion.
    pub fn load_double(&self, addr: u64) -> Result<(f64, bool), SimError> {
        let (bits, hit) = self.load_word(addr)?;
        Ok((f64::from_bits(bits), hit))
    }

    pub fn store_double(&self, addr: u64, value: f64) -> Result<bool, SimError> {
        self.store_word(addr, value.to_bits())
    }

    /// Write every valid dirty line back to memory. MESI is unchanged: a
    /// Modified line stays Modified with a clean payload.
    pub fn flush_all(&self) -> Result<(), SimError> {
        let cid = self.id();
        let mut inner = self.inner.lock();
        for set_idx in 0..SETS {
            for way in 0..WAYS {
                let line = inner.sets[set_idx].ways[way];
                if line.valid && line.dirty {
                    let base = line_base_for(line.tag, set_idx);
                    inner.write_back(set_idx, way, base, self.mem.as_ref())?;
                    inner.note(&format!("C{}: write back {:#06x} (flush)", cid, base));
                }
            }
        }
        Ok(())
    }

    /// Drop every line. Dirty data is discarded; statistics are untouched.
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        for set in inner.sets.iter_mut() {
            for line in set.ways.iter_mut() {
                *line = Line::empty();
            }
        }
    }

    pub fn reset_stats(&self) {
        self.inner.lock().stats = CacheStats::default();
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// MESI state of the line holding `addr`, if resident.
    pub fn line_mesi(&self, addr: u64) -> Option<MesiState> {
        let inner = self.inner.lock();
        let set_idx = set_index(addr);
        inner
            .find_hit(set_idx, tag(addr))
            .map(|w| inner.sets[set_idx].ways[w].mesi)
    }

    pub fn line_info(&self, set: usize, way: usize) -> Result<LineInfo, SimError> {
        if set >= SETS {
            return Err(SimError::BadSet(set));
        }
        if way >= WAYS {
            return Err(SimError::BadWay(way));
        }
        let inner = self.inner.lock();
        let line = &inner.sets[set].ways[way];
        Ok(LineInfo {
            tag: line.tag,
            valid: line.valid,
            dirty: line.dirty,
            mesi: line.mesi,
            last_use: line.last_use,
        })
    }

    /// Human-readable dump of every set/way plus the counters.
    pub fn dump(&self) -> String {
        let inner = self.inner.lock();
        let mut s = String::new();
        s.push_str(&format!("C{} (sets={}, ways={})\n", self.id(), SETS, WAYS));
        for (si, set) in inner.sets.iter().enumerate() {
            for (wi, l) in set.ways.iter().enumerate() {
                s.push_str(&format!(
                    "  set {} way {} | V={} D={} MESI={} tag={:#x} lru={}\n",
                    si, wi, l.valid as u8, l.dirty as u8, l.mesi, l.tag, l.last_use
                ));
            }
        }
        let st = inner.stats;
        s.push_str(&format!(
            "  hits={} misses={} fills={} wbs={} memR={} memW={} | busRd={} busRdX={} busInv={} | snoopI={} snoopS={} snoopFlush={}\n",
            st.hits, st.misses, st.line_fills, st.writebacks, st.mem_reads, st.mem_writes,
            st.bus_rd, st.bus_rdx, st.bus_inv, st.snoop_to_i, st.snoop_to_s, st.snoop_flush
        ));
        s
    }

    /// React to a peer's bus transaction. Runs entirely under the cache
    /// lock; the interconnect guarantees it never holds its own lock here.
    pub fn snoop(&self, msg: BusMsg, line_base: u64) {
        let cid = self.id();
        let mut inner = self.inner.lock();
        let set_idx = set_index(line_base);
        let Some(w) = inner.find_hit(set_idx, tag(line_base)) else {
            return;
        };
        match msg {
            BusMsg::BusRd => match inner.sets[set_idx].ways[w].mesi {
                MesiState::Modified => {
                    // the reader will fetch from memory, so the dirty data
                    // must land there first
                    if let Err(e) = inner.write_back(set_idx, w, line_base, self.mem.as_ref()) {
                        error!("C{}: snoop write-back of {:#06x} failed: {}", cid, line_base, e);
                    }
                    inner.stats.snoop_flush += 1;
                    inner.sets[set_idx].ways[w].mesi = MesiState::Shared;
                    inner.note(&format!("C{}: snoop BusRd {:#06x} M -> S (flush)", cid, line_base));
                }
                MesiState::Exclusive => {
                    inner.sets[set_idx].ways[w].mesi = MesiState::Shared;
                    inner.stats.snoop_to_s += 1;
                    inner.note(&format!("C{}: snoop BusRd {:#06x} E -> S", cid, line_base));
                }
                _ => {} // Shared stays Shared
            },
            BusMsg::BusRdX | BusMsg::Invalidate => {
                let state = inner.sets[set_idx].ways[w].mesi;
                if state == MesiState::Modified {
                    if let Err(e) = inner.write_back(set_idx, w, line_base, self.mem.as_ref()) {
                        error!("C{}: snoop write-back of {:#06x} failed: {}", cid, line_base, e);
                    }
                    inner.stats.snoop_flush += 1;
                }
                let line = &mut inner.sets[set_idx].ways[w];
                line.mesi = MesiState::Invalid;
                line.valid = false;
                line.dirty = false;
                inner.stats.snoop_to_i += 1;
                inner.note(&format!(
                    "C{}: snoop {:?} {:#06x} {} -> I",
                    cid, msg, line_base, state
                ));
            }
            // the issuer performs the memory write itself
            BusMsg::Flush => {}
        }
    }

    /// Emit a transaction on the bus, if one is attached. No cache lock is
    /// held while the broadcast runs.
    fn emit(&self, msg: BusMsg, base: u64) {
        let bus = self.bus.lock().clone();
        let Some(bus) = bus else { return };
        let cid = self.id();
        {
            let mut inner = self.inner.lock();
            match msg {
                BusMsg::BusRd => inner.stats.bus_rd += 1,
                BusMsg::BusRdX => inner.stats.bus_rdx += 1,
                BusMsg::Invalidate => inner.stats.bus_inv += 1,
                BusMsg::Flush => {}
            }
            inner.note(&format!("C{}: emit {:?} {:#06x}", cid, msg, base));
        }
        bus.broadcast(cid, msg, base);
    }
}

impl BusClient for Cache {
    fn client_id(&self) -> u32 {
        self.id()
    }

    fn snoop(&self, msg: BusMsg, line_base: u64) {
        Cache::snoop(self, msg, line_base)
    }
}
