//! Fixed-layout transport records exchanged between ranks.
//!
//! Records are plain `#[repr(C)]` structs with no padding, so a batch is
//! just its bytes. Vectors are always three wide; components beyond the
//! dimensionality are zero.

use bytemuck::{Pod, Zeroable};
use search::{DomainBox, Particle, ParticleType};

use crate::error::DomainError;

/// Value written into the last field by the startup layout check.
pub const VERIFY_SENTINEL: u32 = u32::MAX;

/// One particle on the wire.
/// Field order is part of the protocol; `iorig` must stay last.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct ParticleRecord {
    /// Position
    pub r: [f32; 3],
    /// Velocity
    pub v: [f32; 3],
    /// Total acceleration
    pub a: [f32; 3],
    /// Gravitational acceleration
    pub agrav: [f32; 3],
    /// Smoothing length
    pub h: f32,
    /// `1 / h`
    pub invh: f32,
    /// Mass
    pub m: f32,
    /// Specific internal energy
    pub u: f32,
    /// Heating rate
    pub dudt: f32,
    /// Density
    pub rho: f32,
    /// Gravitational potential
    pub gpot: f32,
    /// Gravitational potential energy
    pub gpe: f32,
    /// `ParticleType` discriminant
    pub ptype: u32,
    /// Non-zero if active this step
    pub active: u32,
    /// Timestep level
    pub level: i32,
    /// Highest timestep level among the neighbours
    pub levelneib: i32,
    /// Original index; the startup check writes its sentinel here
    pub iorig: u32,
}

/// Domain box on the wire.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct BoxRecord {
    /// Lower corner
    pub boxmin: [f32; 3],
    /// Upper corner
    pub boxmax: [f32; 3],
}

/// Load balancing sample: a particle position and its work estimate.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct WorkSample {
    /// Particle position
    pub r: [f32; 3],
    /// Work estimate (`2^level`)
    pub work: f32,
}

fn widen<const D: usize>(v: &[f32; D]) -> [f32; 3] {
    let mut out = [0.0; 3];
    for (o, x) in out.iter_mut().zip(v) {
        *o = *x;
    }
    out
}

fn narrow<const D: usize>(v: &[f32; 3]) -> [f32; D] {
    std::array::from_fn(|k| v.get(k).copied().unwrap_or(0.0))
}

impl ParticleRecord {
    /// Pack a particle, padding vectors to three components.
    pub fn from_particle<const D: usize>(p: &Particle<D>) -> Self {
        Self {
            r: widen(&p.r),
            v: widen(&p.v),
            a: widen(&p.a),
            agrav: widen(&p.agrav),
            h: p.h,
            invh: p.invh,
            m: p.m,
            u: p.u,
            dudt: p.dudt,
            rho: p.rho,
            gpot: p.gpot,
            gpe: p.gpe,
            ptype: p.ptype as u32,
            active: u32::from(p.active),
            level: p.level,
            levelneib: p.levelneib,
            iorig: p.iorig,
        }
    }

    /// Unpack into a `D`-dimensional particle. Fails on an unknown particle type.
    pub fn to_particle<const D: usize>(&self) -> Result<Particle<D>, DomainError> {
        let ptype = u8::try_from(self.ptype)
            .ok()
            .and_then(ParticleType::from_repr)
            .ok_or_else(|| DomainError::Transport(format!("unknown particle type {}", self.ptype)))?;

        Ok(Particle {
            ptype,
            active: self.active != 0,
            level: self.level,
            levelneib: self.levelneib,
            iorig: self.iorig,
            r: narrow(&self.r),
            v: narrow(&self.v),
            a: narrow(&self.a),
            agrav: narrow(&self.agrav),
            h: self.h,
            invh: self.invh,
            m: self.m,
            u: self.u,
            dudt: self.dudt,
            rho: self.rho,
            gpot: self.gpot,
            gpe: self.gpe,
        })
    }
}

impl BoxRecord {
    /// Pack a domain box.
    pub fn from_box<const D: usize>(b: &DomainBox<D>) -> Self {
        Self {
            boxmin: widen(&b.boxmin),
            boxmax: widen(&b.boxmax),
        }
    }

    /// Unpack into a `D`-dimensional box.
    pub fn to_box<const D: usize>(&self) -> DomainBox<D> {
        DomainBox::new(narrow(&self.boxmin), narrow(&self.boxmax))
    }
}

impl WorkSample {
    /// Sample at `r` carrying `work`.
    pub fn new<const D: usize>(r: &[f32; D], work: f32) -> Self {
        Self { r: widen(r), work }
    }

    /// Sample position in `D` dimensions.
    pub fn position<const D: usize>(&self) -> [f32; D] {
        narrow(&self.r)
    }
}

/// Records as raw bytes.
pub fn encode<T: Pod>(records: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(records).to_vec()
}

/// Raw bytes back into records. The payload need not be aligned but must
/// hold a whole number of records.
pub fn decode<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, DomainError> {
    let size = std::mem::size_of::<T>();
    if size == 0 || bytes.len() % size != 0 {
        return Err(DomainError::Transport(format!(
            "payload of {} bytes is not a whole number of {}-byte records",
            bytes.len(),
            size
        )));
    }
    Ok(bytes.chunks_exact(size).map(bytemuck::pod_read_unaligned).collect())
}

/// Committed particle layout for `D` dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticleDatatype {
    dimensions: usize,
}

impl ParticleDatatype {
    /// Register the record layout. Fails for dimensionality outside 1..=3.
    pub fn commit<const D: usize>() -> Result<Self, DomainError> {
        if D == 0 || D > 3 {
            return Err(DomainError::Config(format!(
                "particle records carry 1 to 3 dimensions (got {D})"
            )));
        }
        Ok(Self { dimensions: D })
    }

    /// Dimensionality the layout was committed for.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Bytes per particle record.
    pub fn record_size(&self) -> usize {
        std::mem::size_of::<ParticleRecord>()
    }

    /// Particles as a record payload.
    pub fn encode_particles<const D: usize>(&self, particles: &[Particle<D>]) -> Vec<u8> {
        let records: Vec<ParticleRecord> =
            particles.iter().map(ParticleRecord::from_particle).collect();
        encode(&records)
    }

    /// Record payload back into particles. The dimensionality must match the commit.
    pub fn decode_particles<const D: usize>(
        &self,
        bytes: &[u8],
    ) -> Result<Vec<Particle<D>>, DomainError> {
        if D != self.dimensions {
            return Err(DomainError::Protocol(format!(
                "datatype committed for {}D, decoding {D}D particles",
                self.dimensions
            )));
        }
        decode::<ParticleRecord>(bytes)?
            .iter()
            .map(ParticleRecord::to_particle)
            .collect()
    }
}

/// Domain boxes as a record payload.
pub fn encode_boxes<const D: usize>(boxes: &[DomainBox<D>]) -> Vec<u8> {
    let records: Vec<BoxRecord> = boxes.iter().map(BoxRecord::from_box).collect();
    encode(&records)
}

/// Record payload back into domain boxes.
pub fn decode_boxes<const D: usize>(bytes: &[u8]) -> Result<Vec<DomainBox<D>>, DomainError> {
    Ok(decode::<BoxRecord>(bytes)?.iter().map(BoxRecord::to_box).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_has_no_padding() {
        assert_eq!(std::mem::size_of::<ParticleRecord>(), 100);
        assert_eq!(std::mem::size_of::<BoxRecord>(), 24);
        assert_eq!(std::mem::size_of::<WorkSample>(), 16);
    }

    #[test]
    fn particle_round_trip_is_bit_exact() {
        let mut p = Particle::<2>::new([1.5, -2.25], 0.125, 0.3);
        p.v = [f32::MIN_POSITIVE, -0.0];
        p.a = [1e30, -1e-30];
        p.dudt = 3.0;
        p.level = 5;
        p.levelneib = 7;
        p.iorig = 42;
        p.active = false;

        let datatype = ParticleDatatype::commit::<2>().unwrap();
        let bytes = datatype.encode_particles(&[p]);
        assert_eq!(bytes.len(), datatype.record_size());

        let back = datatype.decode_particles::<2>(&bytes).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].r.map(f32::to_bits), p.r.map(f32::to_bits));
        assert_eq!(back[0].v.map(f32::to_bits), p.v.map(f32::to_bits));
        assert_eq!(back[0], p);
    }

    #[test]
    fn unused_components_are_zero() {
        let record = ParticleRecord::from_particle(&Particle::<1>::new([4.0], 1.0, 1.0));
        assert_eq!(record.r, [4.0, 0.0, 0.0]);
    }

    #[test]
    fn dead_particles_survive_transport() {
        let mut p = Particle::<3>::new([0.0; 3], 1.0, 1.0);
        p.kill();
        let record = ParticleRecord::from_particle(&p);
        assert!(!record.to_particle::<3>().unwrap().is_live());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = encode_boxes(&[DomainBox::new([0.0, 0.0], [1.0, 1.0])]);
        assert!(matches!(
            decode_boxes::<2>(&bytes[..bytes.len() - 1]),
            Err(DomainError::Transport(_))
        ));
    }

    #[test]
    fn unknown_particle_type_is_rejected() {
        let mut record = ParticleRecord::from_particle(&Particle::<1>::new([0.0], 1.0, 1.0));
        record.ptype = 9;
        assert!(record.to_particle::<1>().is_err());
    }

    #[test]
    fn decode_checks_dimensionality() {
        let datatype = ParticleDatatype::commit::<3>().unwrap();
        let bytes = datatype.encode_particles(&[Particle::<3>::new([0.0; 3], 1.0, 1.0)]);
        assert!(matches!(
            datatype.decode_particles::<2>(&bytes),
            Err(DomainError::Protocol(_))
        ));
        assert!(ParticleDatatype::commit::<4>().is_err());
    }
}
