//! Position mapping through steps.
//!
//! A [`StepMap`] describes which ranges of the old document a step replaced
//! and how large the replacements are. A [`Mapping`] chains step maps and
//! knows which maps mirror each other (a step and its inverse), so positions
//! can survive a step being undone and redone during rebase.

const DEL_BEFORE: u8 = 1;
const DEL_AFTER: u8 = 2;
const DEL_ACROSS: u8 = 4;
const DEL_SIDE: u8 = 8;

/// Which side of inserted content a position sticks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bias {
    /// Stay before content inserted exactly at the position
    Start,
    /// Move past content inserted exactly at the position
    #[default]
    End,
}

impl Bias {
    fn assoc(self) -> i8 {
        match self {
            Bias::Start => -1,
            Bias::End => 1,
        }
    }
}

/// Points back into a replaced range so a mirrored map can restore the offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recover {
    index: usize,
    offset: usize,
}

/// The outcome of mapping a single position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResult {
    pub pos: usize,
    del_info: u8,
    recover: Option<Recover>,
}

impl MapResult {
    fn new(pos: usize, del_info: u8, recover: Option<Recover>) -> Self {
        Self {
            pos,
            del_info,
            recover,
        }
    }

    /// Whether the content on the biased side of the position was deleted
    pub fn deleted(&self) -> bool {
        self.del_info & DEL_SIDE > 0
    }

    pub fn deleted_before(&self) -> bool {
        self.del_info & (DEL_BEFORE | DEL_ACROSS) > 0
    }

    pub fn deleted_after(&self) -> bool {
        self.del_info & (DEL_AFTER | DEL_ACROSS) > 0
    }

    /// Whether the position sat strictly inside a deleted range
    pub fn deleted_across(&self) -> bool {
        self.del_info & DEL_ACROSS > 0
    }

    /// The mapped position, or `None` when it fell inside deleted content
    pub fn position(&self) -> Option<usize> {
        (!self.deleted()).then_some(self.pos)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Range {
    start: usize,
    old_size: usize,
    new_size: usize,
}

/// The position map of a single step
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepMap {
    ranges: Vec<Range>,
    inverted: bool,
}

impl StepMap {
    /// A map where `old_size` positions at `start` became `new_size` positions
    pub fn new(start: usize, old_size: usize, new_size: usize) -> Self {
        if old_size == 0 && new_size == 0 {
            return Self::empty();
        }
        Self {
            ranges: vec![Range {
                start,
                old_size,
                new_size,
            }],
            inverted: false,
        }
    }

    /// The identity map, used by steps that do not change positions
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The map of the inverse step
    pub fn invert(&self) -> StepMap {
        StepMap {
            ranges: self.ranges.clone(),
            inverted: !self.inverted,
        }
    }

    fn sizes(&self, range: &Range) -> (usize, usize) {
        if self.inverted {
            (range.new_size, range.old_size)
        } else {
            (range.old_size, range.new_size)
        }
    }

    /// Restore a position from recover information produced by the mirrored map
    pub fn recover(&self, recover: Recover) -> Option<usize> {
        let range = self.ranges.get(recover.index)?;
        let mut diff: isize = 0;
        if !self.inverted {
            for earlier in &self.ranges[..recover.index] {
                diff += earlier.new_size as isize - earlier.old_size as isize;
            }
        }
        Some((range.start as isize + diff) as usize + recover.offset)
    }

    pub fn map(&self, pos: usize, bias: Bias) -> usize {
        self.map_inner(pos, bias.assoc()).pos
    }

    pub fn map_result(&self, pos: usize, bias: Bias) -> MapResult {
        self.map_inner(pos, bias.assoc())
    }

    fn map_inner(&self, pos: usize, assoc: i8) -> MapResult {
        let mut diff: isize = 0;
        for (index, range) in self.ranges.iter().enumerate() {
            let start = if self.inverted {
                (range.start as isize - diff) as usize
            } else {
                range.start
            };
            if start > pos {
                break;
            }
            let (old_size, new_size) = self.sizes(range);
            let end = start + old_size;
            if pos <= end {
                let side = if old_size == 0 {
                    assoc
                } else if pos == start {
                    -1
                } else if pos == end {
                    1
                } else {
                    assoc
                };
                let base = (start as isize + diff) as usize;
                let result = if side < 0 { base } else { base + new_size };
                let edge = if assoc < 0 { start } else { end };
                let recover = (pos != edge).then_some(Recover {
                    index,
                    offset: pos - start,
                });
                let mut del = if pos == start {
                    DEL_AFTER
                } else if pos == end {
                    DEL_BEFORE
                } else {
                    DEL_ACROSS
                };
                if pos != edge {
                    del |= DEL_SIDE;
                }
                return MapResult::new(result, del, recover);
            }
            diff += new_size as isize - old_size as isize;
        }
        MapResult::new((pos as isize + diff) as usize, 0, None)
    }
}

/// A pipeline of step maps, with mirror pairs between maps that undo each other
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapping {
    maps: Vec<StepMap>,
    mirror: Vec<(usize, usize)>,
    from: usize,
    to: usize,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_maps(maps: Vec<StepMap>) -> Self {
        let to = maps.len();
        Self {
            maps,
            mirror: Vec::new(),
            from: 0,
            to,
        }
    }

    pub fn maps(&self) -> &[StepMap] {
        &self.maps[self.from..self.to]
    }

    pub fn len(&self) -> usize {
        self.to - self.from
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A mapping covering only the maps from index `from` on
    pub fn slice(&self, from: usize) -> Mapping {
        Mapping {
            maps: self.maps.clone(),
            mirror: self.mirror.clone(),
            from: self.from + from,
            to: self.to,
        }
    }

    /// Append a map, optionally recording that it mirrors the map at `mirror`
    pub fn append_map(&mut self, map: StepMap, mirror: Option<usize>) {
        self.maps.truncate(self.to);
        self.maps.push(map);
        self.to = self.maps.len();
        if let Some(mirror) = mirror {
            self.set_mirror(self.to - 1, mirror);
        }
    }

    /// Append all maps of another mapping, keeping its mirror pairs
    pub fn append_mapping(&mut self, other: &Mapping) {
        let start = self.maps.len();
        for (i, map) in other.maps().iter().enumerate() {
            let mirror = other
                .get_mirror(other.from + i)
                .filter(|&m| m < other.from + i && m >= other.from)
                .map(|m| start + m - other.from);
            self.append_map(map.clone(), mirror);
        }
    }

    /// The inverse mapping: maps inverted, in reverse order
    pub fn invert(&self) -> Mapping {
        let mut inverse = Mapping::new();
        let total = self.len();
        for i in (0..total).rev() {
            let mirror = self
                .get_mirror(self.from + i)
                .filter(|&m| m > self.from + i && m < self.to)
                .map(|m| total - (m - self.from) - 1);
            inverse.append_map(self.maps[self.from + i].invert(), mirror);
        }
        inverse
    }

    pub fn get_mirror(&self, n: usize) -> Option<usize> {
        self.mirror.iter().find_map(|&(a, b)| {
            if a == n {
                Some(b)
            } else if b == n {
                Some(a)
            } else {
                None
            }
        })
    }

    pub fn set_mirror(&mut self, n: usize, m: usize) {
        self.mirror.push((n, m));
    }

    pub fn map(&self, pos: usize, bias: Bias) -> usize {
        self.map_result(pos, bias).pos
    }

    pub fn map_result(&self, pos: usize, bias: Bias) -> MapResult {
        let mut pos = pos;
        let mut del_info = 0;
        let mut i = self.from;
        while i < self.to {
            let result = self.maps[i].map_result(pos, bias);
            if let Some(recover) = result.recover {
                let restored = self
                    .get_mirror(i)
                    .filter(|&corr| corr > i && corr < self.to)
                    .and_then(|corr| self.maps[corr].recover(recover).map(|p| (corr, p)));
                if let Some((corr, restored)) = restored {
                    pos = restored;
                    i = corr + 1;
                    continue;
                }
            }
            del_info |= result.del_info;
            pos = result.pos;
            i += 1;
        }
        MapResult::new(pos, del_info, None)
    }
}
