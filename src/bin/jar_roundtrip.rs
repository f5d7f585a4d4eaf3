//! Rewrites every class of a jar in memory and parses the result back.
//!
//! Each class is written twice: once untouched and once with a simple
//! interceptor on every method that has a body. Both outputs must parse.

use std::env;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use zip::ZipArchive;

use jvmti_instrument::classfile::{ClassFile, ACC_ABSTRACT, ACC_NATIVE};
use jvmti_instrument::descriptor::MethodType;
use jvmti_instrument::error::InstrumentError;
use jvmti_instrument::host::{ClassLoaderRef, InstrumentHost, NoClassFiles};
use jvmti_instrument::instrument::InstrumentClass;
use jvmti_instrument::interceptor::{InterceptorInstance, InterceptorManifest, InterceptorRegistry};

fn host() -> InstrumentHost {
    let factory =
        |_: &ClassLoaderRef, _: &InterceptorManifest| Ok::<_, InstrumentError>(InterceptorInstance::new(()));
    InstrumentHost::new(Arc::new(InterceptorRegistry::new()), Arc::new(factory), Arc::new(NoClassFiles))
}

/// Names of the methods that can take an interceptor.
fn interceptable(bytes: &[u8]) -> Result<Vec<(String, String)>, Box<dyn std::error::Error>> {
    let class = ClassFile::parse(bytes)?;
    let cp = &class.constant_pool;
    let mut out = Vec::new();
    for m in &class.methods {
        let name = cp.get_utf8(m.name_index)?;
        if m.access_flags & (ACC_ABSTRACT | ACC_NATIVE) != 0 || name == "<clinit>" {
            continue;
        }
        out.push((name.to_string(), cp.get_utf8(m.descriptor_index)?.to_string()));
    }
    Ok(out)
}

fn roundtrip(host: &InstrumentHost, bytes: &[u8]) -> Result<usize, Box<dyn std::error::Error>> {
    let mut plain = InstrumentClass::parse(host.clone(), ClassLoaderRef::Bootstrap, bytes)?;
    ClassFile::parse(&plain.to_bytes()?)?;

    let mut class = InstrumentClass::parse(host.clone(), ClassLoaderRef::Bootstrap, bytes)?;
    let mut intercepted = 0;
    for (name, descriptor) in interceptable(bytes)? {
        let manifest = InterceptorManifest::simple("jvmti.instrument.roundtrip.NoopInterceptor");
        let method_type = MethodType::parse(&descriptor)?;
        let params: Vec<String> = method_type.params.iter().map(|p| p.java_name()).collect();
        let params: Vec<&str> = params.iter().map(String::as_str).collect();
        if let Some(mut method) = class.get_declared_method(&name, &params)? {
            match method.add_interceptor(&manifest) {
                Ok(_) => intercepted += 1,
                Err(InstrumentError::Unsupported(reason)) => log::debug!("skipped {name}: {reason}"),
                Err(e) => return Err(e.into()),
            }
        }
    }
    ClassFile::parse(&class.to_bytes()?)?;
    Ok(intercepted)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let jar_path = env::args().nth(1).ok_or("usage: jar_roundtrip JAR_PATH")?;
    let file = File::open(&jar_path)?;
    let mut zip = ZipArchive::new(file)?;
    let host = host();

    let mut class_files: u64 = 0;
    let mut rewritten: u64 = 0;
    let mut failed: u64 = 0;
    let mut methods: u64 = 0;

    let start = Instant::now();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let name = entry.name().to_string();
        if !name.ends_with(".class") || name.ends_with("module-info.class") {
            continue;
        }
        class_files += 1;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        match roundtrip(&host, &bytes) {
            Ok(n) => {
                rewritten += 1;
                methods += n as u64;
            }
            Err(e) => {
                failed += 1;
                log::warn!("{name}: {e}");
            }
        }
    }
    let dur = start.elapsed();

    println!("jar_path={}", jar_path);
    println!("class_files={}", class_files);
    println!("rewritten_ok={} failed={}", rewritten, failed);
    println!("methods_intercepted={}", methods);
    println!("time_ms={:.3}", dur.as_secs_f64() * 1000.0);

    Ok(())
}
