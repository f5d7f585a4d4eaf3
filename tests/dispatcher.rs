mod support;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use jvmti_instrument::bytecode::{ACONST_NULL, ARETURN, RETURN};
use jvmti_instrument::classfile::ClassFile;
use jvmti_instrument::config::ProfilerConfig;
use jvmti_instrument::dispatcher::{ClassLoadEvent, InstrumentContext, TransformerDispatcher};
use jvmti_instrument::error::InstrumentError;
use jvmti_instrument::host::{ClassLoaderRef, ClassRef, InstrumentHost, LoaderId, Retransformer};
use jvmti_instrument::instrument::{Accessor, ClassFilter, ClassFilters};
use jvmti_instrument::interceptor::{InterceptorGroups, InterceptorManifest, InterceptorRegistry};
use jvmti_instrument::matcher::Matcher;
use jvmti_instrument::plugin::{setup_plugins, ClassFileTransformer, PluginSetupContext, ProfilerPlugin, TransformerEntry, TraceContextHolder};
use jvmti_instrument::runtime::REGISTRY_CLASS;

use support::{code_of, host, host_with_classes, method_names, static_calls, Body, ClassBuilder};

const SERVICE: &str = "com/example/Service";

fn transformer<F>(f: F) -> Arc<dyn ClassFileTransformer>
where
    F: Fn(&InstrumentContext, &ClassLoadEvent<'_>) -> Result<Option<Vec<u8>>, InstrumentError> + Send + Sync + 'static,
{
    Arc::new(f)
}

fn returning(bytes: &'static [u8]) -> Arc<dyn ClassFileTransformer> {
    transformer(move |_, _| Ok(Some(bytes.to_vec())))
}

fn entry(matcher: Matcher, transformer: Arc<dyn ClassFileTransformer>) -> TransformerEntry {
    TransformerEntry { matcher, transformer }
}

fn dispatcher(entries: Vec<TransformerEntry>) -> TransformerDispatcher {
    let (host, _) = host();
    TransformerDispatcher::new(entries, InstrumentContext::new(host))
}

fn load(dispatcher: &TransformerDispatcher, loader: &ClassLoaderRef, name: &str) -> Option<Vec<u8>> {
    dispatcher.on_class_file_load(loader, Some(name), None, None, b"original")
}

fn service_class() -> Vec<u8> {
    ClassBuilder::new(SERVICE)
        .default_constructor()
        .method(0x0001, "run", "()V", |_| Body::new(0, 1, vec![0xb1]))
        .build()
}

#[test]
fn static_transformer_is_selected_by_name() {
    let d = dispatcher(vec![entry(Matcher::class_name("com.example.Service"), returning(b"rewritten"))]);
    assert_eq!(d.len(), 1);
    assert_eq!(load(&d, &ClassLoaderRef::Bootstrap, SERVICE), Some(b"rewritten".to_vec()));
    assert_eq!(load(&d, &ClassLoaderRef::Bootstrap, "com/example/Other"), None);
}

#[test]
fn first_matching_entry_wins() {
    let d = dispatcher(vec![
        entry(Matcher::prefix("com.example."), returning(b"prefix")),
        entry(Matcher::class_name(SERVICE), returning(b"exact")),
    ]);
    assert_eq!(load(&d, &ClassLoaderRef::Bootstrap, SERVICE), Some(b"prefix".to_vec()));
}

#[test]
fn dynamic_transformer_runs_once_before_static_ones() {
    let d = dispatcher(vec![entry(Matcher::class_name(SERVICE), returning(b"static"))]);
    let loader = ClassLoaderRef::Loader(LoaderId(7));
    d.context().add_class_file_transformer(&loader, "com.example.Service", returning(b"dynamic")).unwrap();

    assert_eq!(load(&d, &loader, SERVICE), Some(b"dynamic".to_vec()));
    assert_eq!(load(&d, &loader, SERVICE), Some(b"static".to_vec()));
    assert!(d.context().dynamic_transformers().is_empty());
}

#[test]
fn dynamic_transformers_are_keyed_by_loader() {
    let d = dispatcher(Vec::new());
    let app = ClassLoaderRef::Loader(LoaderId(1));
    let other = ClassLoaderRef::Loader(LoaderId(2));
    let ctx = d.context();
    ctx.add_class_file_transformer(&app, SERVICE, returning(b"dynamic")).unwrap();

    let duplicate = ctx.add_class_file_transformer(&app, "com.example.Service", returning(b"again"));
    assert!(matches!(duplicate, Err(InstrumentError::IllegalState(_))));

    assert_eq!(load(&d, &other, SERVICE), None);
    assert_eq!(ctx.dynamic_transformers().len(), 1);
    assert_eq!(load(&d, &app, SERVICE), Some(b"dynamic".to_vec()));
}

#[test]
fn failures_keep_the_original_class() {
    let d = dispatcher(vec![
        entry(
            Matcher::class_name("com/example/Broken"),
            transformer(|_, _| Err(InstrumentError::Unsupported("broken".to_string()))),
        ),
        entry(Matcher::class_name("com/example/Panics"), transformer(|_, _| panic!("transformer bug"))),
        entry(Matcher::class_name(SERVICE), returning(b"rewritten")),
    ]);
    assert_eq!(load(&d, &ClassLoaderRef::Bootstrap, "com/example/Broken"), None);
    assert_eq!(load(&d, &ClassLoaderRef::Bootstrap, "com/example/Panics"), None);
    assert_eq!(load(&d, &ClassLoaderRef::Bootstrap, SERVICE), Some(b"rewritten".to_vec()));

    let event = ClassLoadEvent::new(&ClassLoaderRef::Bootstrap, "com/example/Broken", b"original");
    let err = d.transform(&event).unwrap_err();
    assert_eq!(err.class_name, "com/example/Broken");
}

#[test]
fn runtime_classes_and_unnamed_classes_are_skipped() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let d = dispatcher(vec![entry(
        Matcher::prefix(""),
        transformer(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }),
    )]);

    assert_eq!(load(&d, &ClassLoaderRef::Bootstrap, REGISTRY_CLASS), None);
    assert_eq!(d.on_class_file_load(&ClassLoaderRef::Bootstrap, None, None, None, b"original"), None);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert_eq!(load(&d, &ClassLoaderRef::Bootstrap, SERVICE), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn instrument_class_is_located_when_bytes_are_missing() {
    let (host, _) = host_with_classes(HashMap::from([(SERVICE.to_string(), service_class())]));
    let ctx = InstrumentContext::new(host);
    let loader = ClassLoaderRef::Bootstrap;

    let class = ctx.get_instrument_class(&loader, "com.example.Service", None).unwrap().expect("located");
    assert_eq!(class.get_name(), "com.example.Service");
    assert!(ctx.get_instrument_class(&loader, "com.example.Missing", None).unwrap().is_none());
    assert!(ctx.exist(&loader, "com.example.Service"));
    assert!(!ctx.exist(&loader, "com/example/Missing"));

    let err = ctx.get_instrument_class(&loader, SERVICE, Some(&b"not a class"[..])).unwrap_err();
    assert!(matches!(err, InstrumentError::ClassFile(_)));
}

struct RecordingRetransformer {
    fail: bool,
    seen: Mutex<Vec<String>>,
}

impl Retransformer for RecordingRetransformer {
    fn retransform(&self, class: &ClassRef) -> Result<(), InstrumentError> {
        self.seen.lock().unwrap().push(class.name.clone());
        if self.fail {
            return Err(InstrumentError::Unsupported("class is not modifiable".to_string()));
        }
        Ok(())
    }
}

#[test]
fn retransform_needs_host_support() {
    let (host, _) = host();
    let ctx = InstrumentContext::new(host);
    let class = ClassRef::new(ClassLoaderRef::Bootstrap, SERVICE, None);
    let err = ctx.retransform(&class, returning(b"x")).unwrap_err();
    assert!(matches!(err, InstrumentError::Unsupported(_)));
    assert!(matches!(ctx.inject_class(&ClassLoaderRef::Bootstrap, SERVICE), Err(InstrumentError::Unsupported(_))));
}

#[test]
fn failed_retransform_drops_the_pending_transformer() {
    let (host, _) = host();
    let retransformer = Arc::new(RecordingRetransformer { fail: true, seen: Mutex::new(Vec::new()) });
    let ctx = InstrumentContext::new(host).with_retransformer(retransformer.clone());
    let class = ClassRef::new(ClassLoaderRef::Bootstrap, SERVICE, None);

    assert!(ctx.retransform(&class, returning(b"x")).is_err());
    assert!(ctx.dynamic_transformers().is_empty());
    assert_eq!(*retransformer.seen.lock().unwrap(), vec![SERVICE.to_string()]);
}

#[test]
fn retransform_runs_transformer_on_redefinition() {
    let (host, _) = host();
    let retransformer = Arc::new(RecordingRetransformer { fail: false, seen: Mutex::new(Vec::new()) });
    let ctx = InstrumentContext::new(host).with_retransformer(retransformer);
    let d = TransformerDispatcher::new(Vec::new(), ctx);
    let class = ClassRef::new(ClassLoaderRef::Bootstrap, SERVICE, None);

    let redefined = transformer(|_, event| {
        assert!(event.class_being_redefined.is_some());
        Ok(Some(b"retransformed".to_vec()))
    });
    d.context().retransform(&class, redefined).unwrap();
    assert_eq!(d.context().dynamic_transformers().len(), 1);

    let rewritten = d.on_class_file_load(&ClassLoaderRef::Bootstrap, Some(SERVICE), Some(&class), None, b"original");
    assert_eq!(rewritten, Some(b"retransformed".to_vec()));
}

#[test]
fn transformer_instruments_the_loaded_class() {
    let (host, registry) = host();
    let intercept = transformer(|ctx, event| {
        let Some(mut class) = ctx.get_instrument_class(event.loader, event.class_name, Some(event.bytes))? else {
            return Ok(None);
        };
        if let Some(mut method) = class.get_declared_method("run", &[])? {
            method.add_interceptor(&InterceptorManifest::simple("com.example.RunInterceptor"))?;
        }
        Ok(Some(class.to_bytes()?))
    });
    let d = TransformerDispatcher::new(vec![entry(Matcher::class_name(SERVICE), intercept)], InstrumentContext::new(host));

    let bytes = service_class();
    let out = d.on_class_file_load(&ClassLoaderRef::Bootstrap, Some(SERVICE), None, None, &bytes).expect("rewritten");
    let class = ClassFile::parse(&out).unwrap();
    assert!(method_names(&class).contains(&"_$APM$_before_1_0".to_string()));
    assert_eq!(registry.len(), 1);

    // Garbage bytes make the same transformer fail; the class loads unchanged.
    assert_eq!(d.on_class_file_load(&ClassLoaderRef::Bootstrap, Some(SERVICE), None, None, b"junk"), None);
}

const HTTP_REQUEST: &str = "com/example/http/HttpRequest";
const ASYNC_CALL: &str = "com/example/http/HttpRequest$1";
const ASYNC_RUNNABLE: &str = "com/example/http/HttpRequest$2";
const SYNC_CALL: &str = "com/example/http/HttpRequest$3";
const EXECUTE_ASYNC: &str = "(Ljava/util/concurrent/Executor;)V";

/// Instruments `executeAsync` and, with `profiler.http.async`, the
/// `Callable`s it creates the first time their loader defines them.
struct HttpPlugin;

impl ProfilerPlugin for HttpPlugin {
    fn name(&self) -> &str {
        "http"
    }

    fn setup(&self, ctx: &mut PluginSetupContext) -> anyhow::Result<()> {
        let async_enabled = ctx.config().read_bool("profiler.http.async", false);
        let rewrite = transformer(move |ctx, event| {
            let Some(mut class) = ctx.get_instrument_class(event.loader, event.class_name, Some(event.bytes))? else {
                return Ok(None);
            };
            if let Some(mut method) = class.get_declared_method("executeAsync", &["java.util.concurrent.Executor"])? {
                method.add_interceptor(&InterceptorManifest::simple("com.example.http.ExecuteAsyncInterceptor"))?;
            }
            if async_enabled {
                let in_execute_async: Box<dyn ClassFilter> =
                    Box::new(ClassFilters::enclosing_method("executeAsync", &["java.util.concurrent.Executor"])?);
                let callable: Box<dyn ClassFilter> = Box::new(ClassFilters::interface("java.util.concurrent.Callable"));
                for nested in class.get_nested_classes(&ClassFilters::chain(vec![in_execute_async, callable]))? {
                    ctx.add_class_file_transformer(event.loader, &nested.get_name(), transformer(instrument_async_call))?;
                }
            }
            Ok(Some(class.to_bytes()?))
        });
        ctx.add_matched_transformer(Matcher::class_name("com.example.http.HttpRequest"), rewrite)?;
        Ok(())
    }
}

fn instrument_async_call(ctx: &InstrumentContext, event: &ClassLoadEvent<'_>) -> Result<Option<Vec<u8>>, InstrumentError> {
    let Some(mut class) = ctx.get_instrument_class(event.loader, event.class_name, Some(event.bytes))? else {
        return Ok(None);
    };
    class.add_field(&Accessor::new("com.example.http.AsyncTraceIdAccessor", "asyncTraceId", "java.lang.Object")?)?;
    if let Some(mut call) = class.get_declared_method("call", &[])? {
        call.add_interceptor(&InterceptorManifest::simple("com.example.http.AsyncCallInterceptor"))?;
    }
    Ok(Some(class.to_bytes()?))
}

fn http_request() -> Vec<u8> {
    ClassBuilder::new(HTTP_REQUEST)
        .default_constructor()
        .method(0x0001, "executeAsync", EXECUTE_ASYNC, |_| Body::new(0, 2, vec![RETURN]))
        .method(0x0001, "execute", "()V", |_| Body::new(0, 1, vec![RETURN]))
        .inner_classes(&[(ASYNC_CALL, None), (ASYNC_RUNNABLE, None), (SYNC_CALL, None)])
        .build()
}

fn nested_task(name: &str, interface: &str, enclosing: (&str, &str)) -> Vec<u8> {
    ClassBuilder::new(name)
        .implements(interface)
        .enclosing_method(HTTP_REQUEST, enclosing.0, enclosing.1)
        .default_constructor()
        .method(0x0001, "call", "()Ljava/lang/Object;", |_| Body::new(1, 1, vec![ACONST_NULL, ARETURN]))
        .build()
}

fn http_host() -> (InstrumentHost, Arc<InterceptorRegistry>, Vec<u8>) {
    let async_call = nested_task(ASYNC_CALL, "java/util/concurrent/Callable", ("executeAsync", EXECUTE_ASYNC));
    let classes = HashMap::from([
        (ASYNC_CALL.to_string(), async_call.clone()),
        (ASYNC_RUNNABLE.to_string(), nested_task(ASYNC_RUNNABLE, "java/lang/Runnable", ("executeAsync", EXECUTE_ASYNC))),
        (SYNC_CALL.to_string(), nested_task(SYNC_CALL, "java/util/concurrent/Callable", ("execute", "()V"))),
    ]);
    let (host, registry) = host_with_classes(classes);
    (host, registry, async_call)
}

fn http_dispatcher(options: &str, host: InstrumentHost) -> TransformerDispatcher {
    let plugins: Vec<Box<dyn ProfilerPlugin>> = vec![Box::new(HttpPlugin)];
    let config = Arc::new(ProfilerConfig::parse(options));
    let setup = setup_plugins(&plugins, config, Arc::new(InterceptorGroups::new()), TraceContextHolder::new()).unwrap();
    TransformerDispatcher::new(setup.transformers, InstrumentContext::new(host))
}

#[test]
fn async_callable_is_instrumented_once_when_its_loader_defines_it() {
    let (host, registry, async_call) = http_host();
    let d = http_dispatcher("profiler.http.async=true", host);
    let app = ClassLoaderRef::Loader(LoaderId(3));

    let outer = d.on_class_file_load(&app, Some(HTTP_REQUEST), None, None, &http_request()).expect("outer rewritten");
    let outer = ClassFile::parse(&outer).unwrap();
    assert!(method_names(&outer).contains(&"_$APM$_before_1_0".to_string()));
    assert_eq!(d.context().dynamic_transformers().len(), 1);

    // Only the loader that loaded HttpRequest gets the inner transformer.
    let web = ClassLoaderRef::Loader(LoaderId(4));
    assert_eq!(d.on_class_file_load(&web, Some(ASYNC_CALL), None, None, &async_call), None);

    let inner = d.on_class_file_load(&app, Some(ASYNC_CALL), None, None, &async_call).expect("callable rewritten");
    let inner = ClassFile::parse(&inner).unwrap();
    assert_eq!(
        inner.interface_names().unwrap(),
        vec!["java/util/concurrent/Callable", "com/example/http/AsyncTraceIdAccessor"]
    );
    let field = &inner.fields[0];
    assert_eq!(inner.constant_pool.get_utf8(field.name_index).unwrap(), "_$APM$_asyncTraceId");
    let names = method_names(&inner);
    assert!(names.contains(&"_$APM$_getAsyncTraceId".to_string()));
    assert!(names.contains(&"_$APM$_setAsyncTraceId".to_string()));
    let call = code_of(&inner, "call");
    let calls = static_calls(&inner, &call.code);
    assert_eq!(calls[0], (ASYNC_CALL.to_string(), "_$APM$_before_2_0".to_string()));
    assert!(calls.contains(&(ASYNC_CALL.to_string(), "_$APM$_after_2_0".to_string())));
    assert_eq!(registry.find_raw(2).unwrap().type_name, "com.example.http.AsyncCallInterceptor");

    assert!(d.context().dynamic_transformers().is_empty());
    assert_eq!(d.on_class_file_load(&app, Some(ASYNC_CALL), None, None, &async_call), None);
    assert_eq!(registry.len(), 2);
}

#[test]
fn async_callable_is_left_alone_without_async_config() {
    let (host, registry, async_call) = http_host();
    let d = http_dispatcher("", host);
    let app = ClassLoaderRef::Loader(LoaderId(3));

    assert!(d.on_class_file_load(&app, Some(HTTP_REQUEST), None, None, &http_request()).is_some());
    assert!(d.context().dynamic_transformers().is_empty());
    assert_eq!(d.on_class_file_load(&app, Some(ASYNC_CALL), None, None, &async_call), None);
    assert_eq!(registry.len(), 1);
}
