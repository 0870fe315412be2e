//! Zones and coordinate packing
//!
//! The world is cut into square zones of `ZONE_SIZE` cells, shifted by
//! `ZONE_OFFSET` so that zone (0, 0) is centered on the origin. Zone ids
//! and positions travel to the contract packed into a `u128`.

use serde::{Deserialize, Serialize};

use cadence_core::Position;

pub const ZONE_SIZE: i64 = 16;
pub const ZONE_OFFSET: i64 = 8;

/// Zone index of a world coordinate
///
/// Zone 0 covers `-8..=7`, zone 1 covers `8..=23`, zone -1 covers `-24..=-9`.
#[inline]
pub fn zone_coord(a: i64) -> i64 {
    (a + ZONE_OFFSET).div_euclid(ZONE_SIZE)
}

/// Coordinate within its zone, in `0..ZONE_SIZE`
#[inline]
pub fn zone_local_coord(a: i64) -> i64 {
    a - (zone_coord(a) * ZONE_SIZE - ZONE_OFFSET)
}

/// Pack a coordinate pair: `x` in the low 64 bits, `y` in the high 64 bits,
/// both two's complement
#[inline]
pub fn pack_xy(x: i64, y: i64) -> u128 {
    (x as u64 as u128) | ((y as u64 as u128) << 64)
}

#[inline]
pub fn unpack_xy(packed: u128) -> Position {
    Position::new(packed as u64 as i64, (packed >> 64) as u64 as i64)
}

#[inline]
pub fn pack_position(position: Position) -> u128 {
    pack_xy(position.x, position.y)
}

/// Packed zone coordinates
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(pub u128);

impl ZoneId {
    pub fn from_zone_coords(zx: i64, zy: i64) -> Self {
        ZoneId(pack_xy(zx, zy))
    }

    /// Zone containing a world position
    pub fn containing(position: Position) -> Self {
        ZoneId::from_zone_coords(zone_coord(position.x), zone_coord(position.y))
    }

    pub fn coords(&self) -> (i64, i64) {
        let p = unpack_xy(self.0);
        (p.x, p.y)
    }
}

/// Rectangle of the world currently on screen, in cells
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct Viewport {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(x: i64, y: i64, width: u32, height: u32) -> Self {
        Viewport {
            x,
            y,
            width,
            height,
        }
    }

    /// Viewport of the given size centered on a position
    pub fn centered_on(center: Position, width: u32, height: u32) -> Self {
        Viewport {
            x: center.x - width as i64 / 2,
            y: center.y - height as i64 / 2,
            width,
            height,
        }
    }

    /// Last covered cell on each axis; an empty extent covers its origin cell
    fn max_cell(&self) -> (i64, i64) {
        (
            self.x + (self.width.max(1) as i64) - 1,
            self.y + (self.height.max(1) as i64) - 1,
        )
    }
}

/// Every zone intersecting the viewport, row-major, without duplicates
pub fn visible_zones(viewport: &Viewport) -> Vec<ZoneId> {
    let (max_x, max_y) = viewport.max_cell();
    let (zx0, zx1) = (zone_coord(viewport.x), zone_coord(max_x));
    let (zy0, zy1) = (zone_coord(viewport.y), zone_coord(max_y));

    let mut zones = Vec::with_capacity(((zx1 - zx0 + 1) * (zy1 - zy0 + 1)) as usize);
    for zy in zy0..=zy1 {
        for zx in zx0..=zx1 {
            zones.push(ZoneId::from_zone_coords(zx, zy));
        }
    }
    zones
}
