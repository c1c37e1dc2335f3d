use std::collections::HashMap;
use std::io::{BufRead, BufReader, Stdin, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitCode, Stdio};
use std::{env, fs};

use hawk::io::{RioDomain, RioHandler, RioMode, SourceIo, Utf8CharManager};
use hawk::trace::StderrTracer;
use hawk::{Engine, HawkError, HawkResult, Options};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let Some(script_path) = args.get(1) else {
        eprintln!("usage: hawk <script.hwk> [input-file]");
        return ExitCode::FAILURE;
    };

    let source = match fs::read_to_string(script_path) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("error: cannot read {script_path}: {err}");
            return ExitCode::FAILURE;
        }
    };

    let base_dir = Path::new(script_path).parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let options = Options::default();

    let program = {
        let mut io = FsSourceIo::with_main(base_dir, &source);
        let mut parser = match hawk::parser::Parser::new(&mut io, &options) {
            Ok(p) => p,
            Err(err) => return report(&err),
        };
        match parser.parse_program() {
            Ok(p) => p,
            Err(err) => return report(&err),
        }
    };

    let modules = hawk::modules::ModuleRegistry::new();
    let mut rio = StdRio::new();
    let cmgr = Utf8CharManager;
    let mut engine = Engine::new(program, &options, modules, &mut rio, &cmgr);
    if env::var_os("HAWK_TRACE").is_some() {
        engine = engine.with_tracer(Box::new(StderrTracer));
    }

    if let Some(input_path) = args.get(2) {
        if let Err(err) = engine.set_main_source(Some(input_path)) {
            return report(&err);
        }
    }

    match engine.run() {
        Ok(code) => {
            let code = code.clamp(0, i64::from(u8::MAX));
            ExitCode::from(code as u8)
        }
        Err(err) => report(&err),
    }
}

fn report(err: &HawkError) -> ExitCode {
    eprintln!("hawk: {err}");
    ExitCode::FAILURE
}

/// Reads source text from disk, resolving `@include` paths relative to the
/// directory the top-level script lives in (matches the teacher crate's
/// `MemorySourceIo` layout, backed by the filesystem instead of a fixture map).
struct FsSourceIo {
    base_dir: PathBuf,
    sources: Vec<(Option<String>, Vec<char>, usize)>,
}

impl FsSourceIo {
    fn with_main(base_dir: PathBuf, content: &str) -> Self {
        Self { base_dir, sources: vec![(None, content.chars().collect(), 0)] }
    }
}

impl SourceIo for FsSourceIo {
    fn open(&mut self, path: Option<&str>) -> HawkResult<u64> {
        for (idx, (name, _, pos)) in self.sources.iter_mut().enumerate() {
            if name.as_deref() == path {
                *pos = 0;
                return Ok(idx as u64);
            }
        }
        let Some(p) = path else {
            return Err(HawkError::system("main source was not registered"));
        };
        let full = self.base_dir.join(p);
        let content = fs::read_to_string(&full)
            .map_err(|e| HawkError::system(format!("cannot open include '{p}': {e}")))?;
        let idx = self.sources.len() as u64;
        self.sources.push((Some(p.to_owned()), content.chars().collect(), 0));
        Ok(idx)
    }

    fn close(&mut self, _handle: u64) -> HawkResult<()> {
        Ok(())
    }

    fn read(&mut self, handle: u64, buf: &mut [char]) -> HawkResult<usize> {
        let (_, content, pos) = &mut self.sources[handle as usize];
        let n = buf.len().min(content.len() - *pos);
        buf[..n].copy_from_slice(&content[*pos..*pos + n]);
        *pos += n;
        Ok(n)
    }
}

/// One open RIO stream. A pipe keeps its child process alive for the
/// stream's lifetime; closing drops the child's stdin and waits for it.
enum Stream {
    Stdin(BufReader<Stdin>),
    Stdout,
    File { reader: Option<BufReader<fs::File>>, writer: Option<fs::File> },
    Pipe { child: Child, stdin: Option<ChildStdin>, stdout: Option<BufReader<ChildStdout>> },
}

/// Stdio-backed [`RioHandler`]: files on disk, `stdin`/`stdout` for the
/// console domain (name `"-"`), and child processes for pipes (spec §6.2's
/// "file, pipe, console" triad, the concrete half the core leaves to the
/// embedder).
struct StdRio {
    streams: HashMap<u64, Stream>,
    next_handle: u64,
}

impl StdRio {
    fn new() -> Self {
        Self { streams: HashMap::new(), next_handle: 1 }
    }

    fn alloc(&mut self, stream: Stream) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        self.streams.insert(h, stream);
        h
    }

    /// Reads one newline-terminated record; `"\n"` is the only record
    /// separator the host-side reader understands, matching the common-case
    /// default (`RS`) the runtime seeds at startup.
    fn read_record(reader: &mut impl BufRead) -> HawkResult<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let n = reader.read_until(b'\n', &mut buf).map_err(|e| HawkError::system(e.to_string()))?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf))
    }
}

impl RioHandler for StdRio {
    fn open(&mut self, name: &str, mode: RioMode, domain: RioDomain) -> HawkResult<u64> {
        match domain {
            RioDomain::Console => match mode {
                RioMode::Read => Ok(self.alloc(Stream::Stdin(BufReader::new(std::io::stdin())))),
                _ => Ok(self.alloc(Stream::Stdout)),
            },
            RioDomain::File => {
                let path = name;
                match mode {
                    RioMode::Read => {
                        let f = fs::File::open(path).map_err(|e| HawkError::system(format!("open {path}: {e}")))?;
                        Ok(self.alloc(Stream::File { reader: Some(BufReader::new(f)), writer: None }))
                    }
                    RioMode::Write => {
                        let f = fs::File::create(path).map_err(|e| HawkError::system(format!("create {path}: {e}")))?;
                        Ok(self.alloc(Stream::File { reader: None, writer: Some(f) }))
                    }
                    RioMode::Append => {
                        let f = fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(path)
                            .map_err(|e| HawkError::system(format!("append {path}: {e}")))?;
                        Ok(self.alloc(Stream::File { reader: None, writer: Some(f) }))
                    }
                    RioMode::ReadWrite => {
                        let f = fs::OpenOptions::new()
                            .read(true)
                            .write(true)
                            .create(true)
                            .open(path)
                            .map_err(|e| HawkError::system(format!("open {path}: {e}")))?;
                        let f2 = f.try_clone().map_err(|e| HawkError::system(e.to_string()))?;
                        Ok(self.alloc(Stream::File { reader: Some(BufReader::new(f)), writer: Some(f2) }))
                    }
                }
            }
            RioDomain::Pipe => {
                let (stdin, stdout) = match mode {
                    RioMode::Read => (Stdio::null(), Stdio::piped()),
                    RioMode::Write | RioMode::Append => (Stdio::piped(), Stdio::inherit()),
                    RioMode::ReadWrite => (Stdio::piped(), Stdio::piped()),
                };
                let mut child = Command::new("sh")
                    .arg("-c")
                    .arg(name)
                    .stdin(stdin)
                    .stdout(stdout)
                    .spawn()
                    .map_err(|e| HawkError::system(format!("spawn '{name}': {e}")))?;
                let stdin = child.stdin.take();
                let stdout = child.stdout.take().map(BufReader::new);
                Ok(self.alloc(Stream::Pipe { child, stdin, stdout }))
            }
        }
    }

    fn close(&mut self, handle: u64) -> HawkResult<()> {
        if let Some(stream) = self.streams.remove(&handle) {
            if let Stream::Pipe { mut child, stdin, .. } = stream {
                drop(stdin);
                let _ = child.wait();
            }
        }
        Ok(())
    }

    fn read(&mut self, handle: u64) -> HawkResult<Option<Vec<u8>>> {
        match self.streams.get_mut(&handle) {
            Some(Stream::Stdin(r)) => Self::read_record(r),
            Some(Stream::File { reader: Some(r), .. }) => Self::read_record(r),
            Some(Stream::Pipe { stdout: Some(r), .. }) => Self::read_record(r),
            _ => Err(HawkError::system("stream is not open for reading")),
        }
    }

    fn write(&mut self, handle: u64, data: &[u8]) -> HawkResult<usize> {
        match self.streams.get_mut(&handle) {
            Some(Stream::Stdout) => std::io::stdout().write_all(data).map(|()| data.len()),
            Some(Stream::File { writer: Some(w), .. }) => w.write_all(data).map(|()| data.len()),
            Some(Stream::Pipe { stdin: Some(w), .. }) => w.write_all(data).map(|()| data.len()),
            _ => return Err(HawkError::system("stream is not open for writing")),
        }
        .map_err(|e| HawkError::system(e.to_string()))
    }

    fn flush(&mut self, handle: u64) -> HawkResult<()> {
        match self.streams.get_mut(&handle) {
            Some(Stream::Stdout) => std::io::stdout().flush(),
            Some(Stream::File { writer: Some(w), .. }) => w.flush(),
            Some(Stream::Pipe { stdin: Some(w), .. }) => w.flush(),
            _ => return Ok(()),
        }
        .map_err(|e| HawkError::system(e.to_string()))
    }
}

