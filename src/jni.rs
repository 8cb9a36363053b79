//! JVM entry points for `graphics.scenery.natives.VDIMPIWrapper`.
//!
//! The Kotlin side is an `object`, so instance methods receive the singleton
//! as `this` and `@JvmStatic` methods receive the class. Relay handles live in
//! a process-wide [`HandleRegistry`]; the JVM only ever sees their `long`.
//!
//! Errors become Java exceptions and the method returns `0`/`null`:
//!
//! | Error | Exception |
//! |-------|-----------|
//! | [`Error::InvalidHandle`], [`Error::NotInitialized`] | `IllegalStateException` |
//! | caller errors ([`Error::is_caller_error`]) | `IllegalArgumentException` |
//! | everything else | `RuntimeException` |
//!
//! A `ByteBuffer` returned by a distribute call aliases the handle's region.
//! It is overwritten by the next call on the same handle and must not be
//! touched after `releaseVDIResources`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Once, OnceLock};

use jni::objects::{JByteBuffer, JClass, JIntArray, JObject};
use jni::sys::{jint, jintArray, jlong, jobject};
use jni::JNIEnv;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use crate::buffer::{BufferRole, Capacities, RegionView};
use crate::collective::Runtime;
use crate::comm::{MpiComm, MpiRuntime};
use crate::config::RelayConfig;
use crate::descriptor::ExchangeDescriptor;
use crate::error::{Error, Result};
use crate::registry::HandleRegistry;
use crate::relay::{check_group_size, group_rank, group_size};
use crate::resources::RelayResources;

/// `tracing-subscriber` filter directives for the library's log output.
pub const LOG_VAR: &str = "VDI_RELAY_LOG";

const ILLEGAL_STATE: &str = "java/lang/IllegalStateException";
const ILLEGAL_ARGUMENT: &str = "java/lang/IllegalArgumentException";
const RUNTIME: &str = "java/lang/RuntimeException";

type Relays = HandleRegistry<RelayResources<MpiRuntime>>;

static RELAYS: OnceLock<Relays> = OnceLock::new();
static LOGGING: Once = Once::new();

fn relays() -> &'static Relays {
    RELAYS.get_or_init(HandleRegistry::new)
}

fn init_logging() {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
        // The host may already have installed a subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    });
}

fn exception_class(err: &Error) -> &'static str {
    match err {
        Error::InvalidHandle(_) | Error::NotInitialized => ILLEGAL_STATE,
        err if err.is_caller_error() => ILLEGAL_ARGUMENT,
        _ => RUNTIME,
    }
}

fn throw(env: &mut JNIEnv<'_>, err: &Error) {
    // A failed JNI call may already have left an exception pending.
    if env.exception_check().unwrap_or(false) {
        debug!(%err, "java exception already pending");
        return;
    }
    if let Err(jni_err) = env.throw_new(exception_class(err), err.to_string()) {
        error!(%err, %jni_err, "could not raise java exception");
    }
}

/// Run `body`, turning errors and panics into a pending Java exception and
/// `fallback`.
fn guarded<'local, T>(
    env: &mut JNIEnv<'local>,
    fallback: T,
    body: impl FnOnce(&mut JNIEnv<'local>) -> Result<T>,
) -> T {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut *env)));
    match outcome {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            debug!(%err, "relay call failed");
            throw(env, &err);
            fallback
        }
        Err(_) => {
            error!("panic inside relay call");
            throw(env, &Error::Internal("panic inside native relay call".into()));
            fallback
        }
    }
}

fn jni_error(err: jni::errors::Error) -> Error {
    match err {
        jni::errors::Error::NullPtr(_) | jni::errors::Error::NullDeref(_) => Error::InvalidBuffer,
        other => Error::Internal(format!("JNI call failed: {other}")),
    }
}

fn read_ints(env: &JNIEnv<'_>, array: &JIntArray<'_>) -> Result<Vec<i32>> {
    if array.is_null() {
        return Err(Error::InvalidBuffer);
    }
    let len = env.get_array_length(array).map_err(jni_error)?;
    let mut values = vec![0; usize::try_from(len).map_err(|_| Error::InvalidBuffer)?];
    env.get_int_array_region(array, 0, &mut values)
        .map_err(jni_error)?;
    Ok(values)
}

fn new_int_array<'local>(env: &mut JNIEnv<'local>, values: &[i32]) -> Result<JIntArray<'local>> {
    let len = jint::try_from(values.len()).map_err(|_| Error::InvalidCount(values.len() as i64))?;
    let array = env.new_int_array(len).map_err(jni_error)?;
    env.set_int_array_region(&array, 0, values)
        .map_err(jni_error)?;
    Ok(array)
}

/// Borrow the contents of a direct `ByteBuffer`.
///
/// # Safety
///
/// The JVM must not free or write the buffer while the slice is alive; the
/// caller holds a local reference for the whole native call.
unsafe fn direct_bytes<'b>(env: &JNIEnv<'_>, buffer: &JByteBuffer<'_>) -> Result<&'b [u8]> {
    if buffer.is_null() {
        return Err(Error::InvalidBuffer);
    }
    let len = env.get_direct_buffer_capacity(buffer).map_err(jni_error)?;
    if len == 0 {
        return Ok(&[]);
    }
    let ptr = env.get_direct_buffer_address(buffer).map_err(jni_error)?;
    Ok(std::slice::from_raw_parts(ptr, len))
}

fn wrap_view<'local>(env: &mut JNIEnv<'local>, mut view: RegionView<'_>) -> Result<JByteBuffer<'local>> {
    let len = view.len();
    // Safety: the region is heap memory owned by the registry entry and never
    // moves; it outlives the buffer for as long as the handle is not released.
    unsafe { env.new_direct_byte_buffer(view.as_mut_ptr(), len) }.map_err(jni_error)
}

fn active_world() -> Result<MpiComm> {
    if MpiRuntime::default().is_active() {
        Ok(MpiComm::world())
    } else {
        Err(Error::NotInitialized)
    }
}

#[allow(clippy::too_many_arguments)]
fn distribute_variable<'local>(
    env: &mut JNIEnv<'local>,
    role: BufferRole,
    handle: jlong,
    local: &JByteBuffer<'_>,
    counts: &JIntArray<'_>,
    displacements: &JIntArray<'_>,
    counts_recv: &JIntArray<'_>,
    displacements_recv: &JIntArray<'_>,
    comm_size: jint,
) -> Result<JByteBuffer<'local>> {
    let descriptor = ExchangeDescriptor::new(
        read_ints(env, counts)?,
        read_ints(env, displacements)?,
        read_ints(env, counts_recv)?,
        read_ints(env, displacements_recv)?,
    );
    let local = unsafe { direct_bytes(env, local)? };
    relays().with(handle, |resources| {
        let world = active_world()?;
        check_group_size(&world, comm_size)?;
        let view = resources.distribute(&world, role, local, &descriptor)?;
        wrap_view(env, view)
    })
}

/// `initializeVDIResources(colorCapacity: Int, depthCapacity: Int, prefixCapacity: Int): Long`
#[no_mangle]
pub extern "system" fn Java_graphics_scenery_natives_VDIMPIWrapper_initializeVDIResources<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    color_capacity: jint,
    depth_capacity: jint,
    prefix_capacity: jint,
) -> jlong {
    init_logging();
    guarded(&mut env, 0, |_| {
        let capacities = Capacities::from_raw(color_capacity, depth_capacity, prefix_capacity)?;
        let config = RelayConfig::from_env()?.with_capacities(capacities);
        let resources = RelayResources::from_config(MpiRuntime::new(config.thread_level), &config)?;
        Ok(relays().insert(resources).as_raw())
    })
}

/// `distributeSupersegmentCounts(nativeHandle: Long, supersegmentCounts: IntArray, commSize: Int): IntArray`
#[no_mangle]
pub extern "system" fn Java_graphics_scenery_natives_VDIMPIWrapper_distributeSupersegmentCounts<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    handle: jlong,
    supersegment_counts: JIntArray<'local>,
    comm_size: jint,
) -> jintArray {
    guarded(&mut env, std::ptr::null_mut(), |env| {
        let counts = read_ints(env, &supersegment_counts)?;
        let received = relays().with(handle, |resources| {
            let world = active_world()?;
            check_group_size(&world, comm_size)?;
            resources.distribute_counts(&world, &counts)
        })?;
        Ok(JObject::from(new_int_array(env, &received)?).into_raw())
    })
}

/// `distributeColorVDI(nativeHandle, colorVDI, counts, displacements, countsRecv, displacementsRecv, commSize): ByteBuffer`
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "system" fn Java_graphics_scenery_natives_VDIMPIWrapper_distributeColorVDI<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    handle: jlong,
    color_vdi: JByteBuffer<'local>,
    counts: JIntArray<'local>,
    displacements: JIntArray<'local>,
    counts_recv: JIntArray<'local>,
    displacements_recv: JIntArray<'local>,
    comm_size: jint,
) -> jobject {
    guarded(&mut env, std::ptr::null_mut(), |env| {
        distribute_variable(
            env,
            BufferRole::Color,
            handle,
            &color_vdi,
            &counts,
            &displacements,
            &counts_recv,
            &displacements_recv,
            comm_size,
        )
        .map(|buffer| JObject::from(buffer).into_raw())
    })
}

/// `distributeDepthVDI(nativeHandle, depthVDI, counts, displacements, countsRecv, displacementsRecv, commSize): ByteBuffer`
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "system" fn Java_graphics_scenery_natives_VDIMPIWrapper_distributeDepthVDI<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    handle: jlong,
    depth_vdi: JByteBuffer<'local>,
    counts: JIntArray<'local>,
    displacements: JIntArray<'local>,
    counts_recv: JIntArray<'local>,
    displacements_recv: JIntArray<'local>,
    comm_size: jint,
) -> jobject {
    guarded(&mut env, std::ptr::null_mut(), |env| {
        distribute_variable(
            env,
            BufferRole::Depth,
            handle,
            &depth_vdi,
            &counts,
            &displacements,
            &counts_recv,
            &displacements_recv,
            comm_size,
        )
        .map(|buffer| JObject::from(buffer).into_raw())
    })
}

/// `distributePrefixVDI(nativeHandle: Long, prefixVDI: ByteBuffer, commSize: Int): ByteBuffer`
#[no_mangle]
pub extern "system" fn Java_graphics_scenery_natives_VDIMPIWrapper_distributePrefixVDI<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    handle: jlong,
    prefix_vdi: JByteBuffer<'local>,
    comm_size: jint,
) -> jobject {
    guarded(&mut env, std::ptr::null_mut(), |env| {
        let local = unsafe { direct_bytes(env, &prefix_vdi)? };
        let buffer = relays().with(handle, |resources| {
            let world = active_world()?;
            check_group_size(&world, comm_size)?;
            let view = resources.distribute_prefix(&world, local)?;
            wrap_view(env, view)
        })?;
        Ok(JObject::from(buffer).into_raw())
    })
}

/// `@JvmStatic getCommSize(): Int`
#[no_mangle]
pub extern "system" fn Java_graphics_scenery_natives_VDIMPIWrapper_getCommSize<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jint {
    guarded(&mut env, 0, |_| Ok(group_size(&active_world()?)))
}

/// `@JvmStatic getCommRank(): Int`
#[no_mangle]
pub extern "system" fn Java_graphics_scenery_natives_VDIMPIWrapper_getCommRank<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jint {
    guarded(&mut env, -1, |_| Ok(group_rank(&active_world()?)))
}

/// `releaseVDIResources(nativeHandle: Long)`
#[no_mangle]
pub extern "system" fn Java_graphics_scenery_natives_VDIMPIWrapper_releaseVDIResources<'local>(
    mut env: JNIEnv<'local>,
    _this: JObject<'local>,
    handle: jlong,
) {
    guarded(&mut env, (), |_| {
        relays().release(handle);
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceptions_follow_the_error_kind() {
        assert_eq!(exception_class(&Error::InvalidHandle(7)), ILLEGAL_STATE);
        assert_eq!(exception_class(&Error::NotInitialized), ILLEGAL_STATE);
        assert_eq!(
            exception_class(&Error::GroupSizeMismatch { given: 3, actual: 4 }),
            ILLEGAL_ARGUMENT
        );
        assert_eq!(
            exception_class(&Error::CapacityExceeded {
                role: BufferRole::Color,
                required: 2,
                capacity: 1
            }),
            ILLEGAL_ARGUMENT
        );
        assert_eq!(exception_class(&Error::MpiError(5)), RUNTIME);
        assert_eq!(exception_class(&Error::Config("x".into())), RUNTIME);
    }

    #[test]
    fn null_references_are_invalid_buffers() {
        assert!(matches!(
            jni_error(jni::errors::Error::NullPtr("array")),
            Error::InvalidBuffer
        ));
    }
}
