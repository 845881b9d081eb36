//! Callback contracts a cache is constructed with.

use crate::platform::AllocFlags;
use std::any::Any;
use std::ptr::NonNull;

pub type PrivData = dyn Any + Send + Sync;

/// Runs once per object at slab birth; must fully initialize the body.
pub type Ctor = Box<dyn Fn(NonNull<u8>, &PrivData, AllocFlags) + Send + Sync>;

/// Runs once per object at slab death; must release anything the
/// constructor acquired.
pub type Dtor = Box<dyn Fn(NonNull<u8>, &PrivData) + Send + Sync>;

/// Invited to return freeable objects to the cache; advisory, called with
/// no cache lock held.
pub type Reclaim = Box<dyn Fn(&PrivData) + Send + Sync>;
