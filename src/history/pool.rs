//! Pooled storage backing the property history buffers.
//!
//! History buffers never own their values. Each entry holds a `PropertyIdx` into
//! the pool of its property type, so evicting, truncating or resetting a buffer
//! only moves indices around and slots get recycled through a free list.
use bytemuck::Zeroable;

use crate::state::{
    JointProxies, JointSettings, KinematicTarget, ParticleDynamicMisc, ParticleDynamics,
    ParticleMassProps, ParticleNonFrequentData, ParticlePositionRotation, ParticleVelocities,
};

/// Opaque index of a slot in a `PropertyPool`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PropertyIdx(u32);

impl PropertyIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Slot storage for one property type with free-list reuse.
#[derive(Debug)]
pub struct PropertyPool<T> {
    elements: Vec<T>,
    free: Vec<u32>,
}

impl<T> Default for PropertyPool<T> {
    fn default() -> Self {
        Self {
            elements: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T: Zeroable> PropertyPool<T> {
    /// Claims a slot, reusing a released one when available. The slot is zeroed.
    pub fn add_element(&mut self) -> (PropertyIdx, &mut T) {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.elements[idx as usize] = T::zeroed();
                idx
            }
            None => {
                self.elements.push(T::zeroed());
                (self.elements.len() - 1) as u32
            }
        };
        (PropertyIdx(idx), &mut self.elements[idx as usize])
    }

    pub fn get(&self, idx: PropertyIdx) -> &T {
        &self.elements[idx.index()]
    }

    pub fn get_mut(&mut self, idx: PropertyIdx) -> &mut T {
        &mut self.elements[idx.index()]
    }

    /// Returns a slot to the free list.
    pub fn remove_element(&mut self, idx: PropertyIdx) {
        debug_assert!(
            !self.free.contains(&idx.0),
            "property slot {} released twice",
            idx.0
        );
        self.free.push(idx.0);
    }

    /// Number of slots currently claimed.
    pub fn num_live(&self) -> usize {
        self.elements.len() - self.free.len()
    }

    /// Number of slots ever allocated.
    pub fn num_allocated(&self) -> usize {
        self.elements.len()
    }
}

/// One pool per history property type. Owned by `RewindData`.
#[derive(Debug, Default)]
pub struct DirtyPropertiesPool {
    position_rotation: PropertyPool<ParticlePositionRotation>,
    velocities: PropertyPool<ParticleVelocities>,
    dynamics: PropertyPool<ParticleDynamics>,
    dynamic_misc: PropertyPool<ParticleDynamicMisc>,
    mass_props: PropertyPool<ParticleMassProps>,
    kinematic_target: PropertyPool<KinematicTarget>,
    non_frequent: PropertyPool<ParticleNonFrequentData>,
    joint_settings: PropertyPool<JointSettings>,
    joint_proxies: PropertyPool<JointProxies>,
}

impl DirtyPropertiesPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool<T: PoolProperty>(&self) -> &PropertyPool<T> {
        T::pool(self)
    }

    pub fn pool_mut<T: PoolProperty>(&mut self) -> &mut PropertyPool<T> {
        T::pool_mut(self)
    }

    /// Slots claimed across every property pool.
    pub fn num_live(&self) -> usize {
        self.position_rotation.num_live()
            + self.velocities.num_live()
            + self.dynamics.num_live()
            + self.dynamic_misc.num_live()
            + self.mass_props.num_live()
            + self.kinematic_target.num_live()
            + self.non_frequent.num_live()
            + self.joint_settings.num_live()
            + self.joint_proxies.num_live()
    }
}

/// Locates the pool that stores values of `Self`.
pub trait PoolProperty: Zeroable + Sized {
    fn pool(pools: &DirtyPropertiesPool) -> &PropertyPool<Self>;
    fn pool_mut(pools: &mut DirtyPropertiesPool) -> &mut PropertyPool<Self>;
}

macro_rules! pool_property {
    ($ty:ty, $field:ident) => {
        impl PoolProperty for $ty {
            fn pool(pools: &DirtyPropertiesPool) -> &PropertyPool<Self> {
                &pools.$field
            }
            fn pool_mut(pools: &mut DirtyPropertiesPool) -> &mut PropertyPool<Self> {
                &mut pools.$field
            }
        }
    };
}

pool_property!(ParticlePositionRotation, position_rotation);
pool_property!(ParticleVelocities, velocities);
pool_property!(ParticleDynamics, dynamics);
pool_property!(ParticleDynamicMisc, dynamic_misc);
pool_property!(ParticleMassProps, mass_props);
pool_property!(KinematicTarget, kinematic_target);
pool_property!(ParticleNonFrequentData, non_frequent);
pool_property!(JointSettings, joint_settings);
pool_property!(JointProxies, joint_proxies);
