use anyhow::Result;
use burn_core::Restart;

use crate::context::EngineContext;
use crate::executor::{
    apply_dependency, begin_session, cache_payload, clean_package, count_related_bundles,
    end_session, resume_session, save_state, PackageExecutor,
};
use crate::request::{
    CachePayloadRequest, CleanRequest, DependencyRequest, ExecuteRequest, RelatedBundlesQuery,
    SaveStateRequest, SessionBeginRequest, SessionEndRequest, SessionRequest,
};
use crate::services::{start_service, stop_service};
use crate::sink::ExecuteSink;

/// Where privileged work for one scope happens: in this process, or in the
/// elevated child over its control channel.
pub trait ExecuteHost {
    fn execute(&mut self, request: &ExecuteRequest, sink: &mut dyn ExecuteSink) -> Result<Restart>;

    fn dependency(&mut self, request: &DependencyRequest) -> Result<()>;

    fn clean(&mut self, request: &CleanRequest) -> Result<()>;

    fn service(&mut self, name: &str, start: bool) -> Result<()>;

    fn session_begin(&mut self, request: &SessionBeginRequest) -> Result<()>;

    fn session_resume(&mut self, request: &SessionRequest) -> Result<()>;

    fn session_end(&mut self, request: &SessionEndRequest) -> Result<()>;

    fn save_state(&mut self, request: &SaveStateRequest) -> Result<()>;

    fn related_bundle_count(&mut self, query: &RelatedBundlesQuery) -> Result<usize>;
}

/// The cache channel counterpart of [`ExecuteHost`].
pub trait CacheHost: Send {
    fn cache_payload(&mut self, request: &CachePayloadRequest) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct LocalHost<'a> {
    context: &'a EngineContext,
    executor: &'a PackageExecutor,
}

impl<'a> LocalHost<'a> {
    pub fn new(context: &'a EngineContext, executor: &'a PackageExecutor) -> Self {
        Self { context, executor }
    }
}

impl ExecuteHost for LocalHost<'_> {
    fn execute(&mut self, request: &ExecuteRequest, sink: &mut dyn ExecuteSink) -> Result<Restart> {
        self.executor.execute(request, sink)
    }

    fn dependency(&mut self, request: &DependencyRequest) -> Result<()> {
        apply_dependency(self.context, request)
    }

    fn clean(&mut self, request: &CleanRequest) -> Result<()> {
        clean_package(self.context, request)
    }

    fn service(&mut self, name: &str, start: bool) -> Result<()> {
        if start {
            start_service(name)
        } else {
            stop_service(name)
        }
    }

    fn session_begin(&mut self, request: &SessionBeginRequest) -> Result<()> {
        begin_session(self.context, request).map(|_| ())
    }

    fn session_resume(&mut self, request: &SessionRequest) -> Result<()> {
        resume_session(self.context, request)
    }

    fn session_end(&mut self, request: &SessionEndRequest) -> Result<()> {
        end_session(self.context, request)
    }

    fn save_state(&mut self, request: &SaveStateRequest) -> Result<()> {
        save_state(self.context, request)
    }

    fn related_bundle_count(&mut self, query: &RelatedBundlesQuery) -> Result<usize> {
        count_related_bundles(self.context, query)
    }
}

impl CacheHost for LocalHost<'_> {
    fn cache_payload(&mut self, request: &CachePayloadRequest) -> Result<()> {
        cache_payload(self.context, request).map(|_| ())
    }
}
